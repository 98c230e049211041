//! Plug-in contracts: architectures, loaders and OS personalities.
//!
//! Plug-ins are plain values handed to whoever needs them through a
//! [`PluginRegistry`] owned by the application; nothing here is global.

use std::sync::Arc;

use core_address::Address;
use core_cpu::{CpuContext, CpuInformation};
use core_document::{Document, FunctionDetail, Id, Instruction};
use core_emul::MemoryContext;
use core_expr::Expression;
use thiserror::Error;

pub mod micro;
pub mod os;
pub mod raw;

pub use micro::MicroArchitecture;
pub use os::BareMetalOs;
pub use raw::RawLoader;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to decode at {0}")]
    Decode(Address),
    #[error("unsupported mode {0}")]
    UnsupportedMode(u8),
    #[error("image rejected: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Document(#[from] core_document::Error),
    #[error(transparent)]
    Cpu(#[from] core_cpu::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Stable 32-bit tag derived from an architecture name (FNV-1a).
pub fn architecture_tag(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// A machine-code back-end: decoding, lifting and formatting for one
/// instruction set.
pub trait Architecture: Send + Sync {
    fn name(&self) -> &str;

    fn endianness(&self) -> Endianness;

    /// ISA variants selectable per address, `(name, mode id)`.
    fn modes(&self) -> Vec<(String, u8)>;

    fn default_mode(&self, addr: &Address) -> u8;

    fn tag(&self) -> u32 {
        architecture_tag(self.name())
    }

    /// Upper bound on encoded instruction length, in bytes.
    fn max_instruction_length(&self) -> usize;

    fn cpu_information(&self) -> Arc<CpuInformation>;

    fn make_cpu_context(&self) -> CpuContext {
        CpuContext::new(self.cpu_information())
    }

    fn make_memory_context(&self) -> MemoryContext {
        MemoryContext::new()
    }

    /// Decodes one instruction from `bytes` located at `addr`. `bytes` may be
    /// shorter than [`max_instruction_length`](Self::max_instruction_length)
    /// near an area end; decoding past it is a [`Error::Decode`].
    fn disassemble(&self, bytes: &[u8], addr: &Address, mode: u8) -> Result<Instruction>;

    /// Renders `insn` for a listing.
    fn format_instruction(
        &self,
        document: &Document,
        addr: &Address,
        insn: &Instruction,
    ) -> Result<String> {
        let _ = (document, addr);
        let operands: Vec<String> = insn.operands().iter().map(|o| o.to_string()).collect();
        Ok(if operands.is_empty() {
            insn.mnemonic.clone()
        } else {
            format!("{} {}", insn.mnemonic, operands.join(", "))
        })
    }
}

/// Maps a binary image into a document.
pub trait Loader: Send + Sync {
    fn name(&self) -> &str;

    fn is_compatible(&self, bytes: &[u8]) -> bool;

    /// Populates the document's memory areas from the image.
    fn map(&self, document: &Document, bytes: &[u8]) -> Result<()>;

    fn entry_point(&self, bytes: &[u8]) -> Option<Address>;

    /// Narrows the candidate architectures for this image; everything by
    /// default.
    fn filter_architectures(
        &self,
        architectures: &[Arc<dyn Architecture>],
    ) -> Vec<Arc<dyn Architecture>> {
        architectures.to_vec()
    }
}

/// Models the runtime environment: initial context and external symbols.
pub trait OperatingSystem: Send + Sync {
    fn name(&self) -> &str;

    fn initialize_context(
        &self,
        document: &Document,
        cpu: &mut CpuContext,
        mem: &mut MemoryContext,
    ) -> Result<()>;

    /// Models a call to an external symbol as an expression fragment: the
    /// ABI return register receives a symbolic returned value and volatile
    /// registers are clobbered.
    fn execute_symbol(&self, document: &Document, addr: &Address) -> Vec<Expression>;

    fn provide_details(&self, document: &Document) -> Result<()> {
        let _ = document;
        Ok(())
    }

    fn function_detail(&self, id: &Id) -> Option<FunctionDetail> {
        let _ = id;
        None
    }
}

/// Application-scope collection of registered plug-ins, passed explicitly to
/// the components that consume them.
#[derive(Default)]
pub struct PluginRegistry {
    architectures: Vec<Arc<dyn Architecture>>,
    loaders: Vec<Arc<dyn Loader>>,
    operating_systems: Vec<Arc<dyn OperatingSystem>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_architecture(&mut self, arch: Arc<dyn Architecture>) {
        tracing::info!(target: "arch", name = arch.name(), tag = arch.tag(), "architecture registered");
        self.architectures.push(arch);
    }

    pub fn register_loader(&mut self, loader: Arc<dyn Loader>) {
        tracing::info!(target: "arch", name = loader.name(), "loader registered");
        self.loaders.push(loader);
    }

    pub fn register_operating_system(&mut self, os: Arc<dyn OperatingSystem>) {
        tracing::info!(target: "arch", name = os.name(), "operating system registered");
        self.operating_systems.push(os);
    }

    pub fn architectures(&self) -> &[Arc<dyn Architecture>] {
        &self.architectures
    }

    pub fn architecture_by_tag(&self, tag: u32) -> Option<Arc<dyn Architecture>> {
        self.architectures.iter().find(|a| a.tag() == tag).cloned()
    }

    pub fn architecture_by_name(&self, name: &str) -> Option<Arc<dyn Architecture>> {
        self.architectures.iter().find(|a| a.name() == name).cloned()
    }

    /// First loader accepting the image.
    pub fn loader_for(&self, bytes: &[u8]) -> Option<Arc<dyn Loader>> {
        self.loaders.iter().find(|l| l.is_compatible(bytes)).cloned()
    }

    pub fn loaders(&self) -> &[Arc<dyn Loader>] {
        &self.loaders
    }

    pub fn operating_system_by_name(&self, name: &str) -> Option<Arc<dyn OperatingSystem>> {
        self.operating_systems
            .iter()
            .find(|o| o.name() == name)
            .cloned()
    }
}
