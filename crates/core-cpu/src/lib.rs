//! CPU register metadata and the per-evaluation register file.
//!
//! An architecture back-end builds one [`CpuInformation`] describing its
//! registers (names, ids, widths) and which registers play the program
//! pointer / stack pointer roles. Evaluations then own a [`CpuContext`]: a
//! sparse register file plus the logical→linear mapping table used by
//! segmented addressing. Register values are little-endian byte buffers so
//! registers wider than 64 bits work without a bignum representation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use core_address::Address;
use thiserror::Error;

pub type RegisterId = u32;

/// Conventional roles an architecture assigns to registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterRole {
    ProgramPointer,
    StackPointer,
    FramePointer,
    Flags,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown register id {0}")]
    UnknownRegister(RegisterId),
    #[error("register {name} is {expected} bytes wide, buffer holds {got}")]
    SizeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("no linear mapping for {0}")]
    Translate(Address),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
struct RegisterDescriptor {
    name: String,
    bits: u16,
}

/// Immutable register metadata shared by identifier expressions, contexts and
/// the evaluator. Built once per architecture and handed around in an `Arc`.
#[derive(Debug, Clone)]
pub struct CpuInformation {
    arch_name: String,
    registers: Vec<RegisterDescriptor>,
    by_name: AHashMap<String, RegisterId>,
    roles: AHashMap<RegisterRole, RegisterId>,
}

impl CpuInformation {
    pub fn builder(arch_name: impl Into<String>) -> CpuInformationBuilder {
        CpuInformationBuilder {
            info: CpuInformation {
                arch_name: arch_name.into(),
                registers: Vec::new(),
                by_name: AHashMap::new(),
                roles: AHashMap::new(),
            },
        }
    }

    pub fn architecture_name(&self) -> &str {
        &self.arch_name
    }

    pub fn register_name(&self, id: RegisterId) -> Option<&str> {
        self.registers.get(id as usize).map(|r| r.name.as_str())
    }

    pub fn register_id(&self, name: &str) -> Option<RegisterId> {
        self.by_name.get(name).copied()
    }

    /// Width of a register in bits, 0 when the id is unknown.
    pub fn register_bits(&self, id: RegisterId) -> u16 {
        self.registers.get(id as usize).map_or(0, |r| r.bits)
    }

    pub fn register_bytes(&self, id: RegisterId) -> usize {
        (self.register_bits(id) as usize).div_ceil(8)
    }

    pub fn register_by_role(&self, role: RegisterRole) -> Option<RegisterId> {
        self.roles.get(&role).copied()
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }
}

pub struct CpuInformationBuilder {
    info: CpuInformation,
}

impl CpuInformationBuilder {
    /// Registers are assigned ids in declaration order.
    pub fn register(mut self, name: &str, bits: u16) -> Self {
        let id = self.info.registers.len() as RegisterId;
        self.info.by_name.insert(name.to_owned(), id);
        self.info.registers.push(RegisterDescriptor {
            name: name.to_owned(),
            bits,
        });
        self
    }

    /// Assign `role` to an already declared register.
    pub fn role(mut self, role: RegisterRole, name: &str) -> Self {
        let id = self
            .info
            .register_id(name)
            .unwrap_or_else(|| panic!("role target {name:?} not declared"));
        self.info.roles.insert(role, id);
        self
    }

    pub fn build(self) -> Arc<CpuInformation> {
        Arc::new(self.info)
    }
}

/// Saved register file + mapping state, restorable with
/// [`CpuContext::restore`].
#[derive(Debug, Clone)]
pub struct CpuSnapshot {
    registers: AHashMap<RegisterId, Vec<u8>>,
    mappings: BTreeMap<Address, Address>,
}

/// Mutable per-evaluation CPU state.
///
/// The register file is sparse: a register that was never written is *unset*
/// and reads as zero through [`read_register`](CpuContext::read_register),
/// while [`is_register_set`](CpuContext::is_register_set) lets the evaluator
/// distinguish "zero" from "unknown" and go symbolic.
#[derive(Debug, Clone)]
pub struct CpuContext {
    info: Arc<CpuInformation>,
    registers: AHashMap<RegisterId, Vec<u8>>,
    mappings: BTreeMap<Address, Address>,
}

impl CpuContext {
    pub fn new(info: Arc<CpuInformation>) -> Self {
        Self {
            info,
            registers: AHashMap::new(),
            mappings: BTreeMap::new(),
        }
    }

    pub fn information(&self) -> &Arc<CpuInformation> {
        &self.info
    }

    fn descriptor_len(&self, id: RegisterId) -> Result<usize> {
        let bytes = self.info.register_bytes(id);
        if bytes == 0 {
            return Err(Error::UnknownRegister(id));
        }
        Ok(bytes)
    }

    pub fn is_register_set(&self, id: RegisterId) -> bool {
        self.registers.contains_key(&id)
    }

    /// Copies the register value into `buf`. `buf` must be exactly as wide as
    /// the register; unset registers read as zero.
    pub fn read_register(&self, id: RegisterId, buf: &mut [u8]) -> Result<()> {
        let expected = self.descriptor_len(id)?;
        if buf.len() != expected {
            return Err(Error::SizeMismatch {
                name: self.info.register_name(id).unwrap_or("?").to_owned(),
                expected,
                got: buf.len(),
            });
        }
        match self.registers.get(&id) {
            Some(value) => buf.copy_from_slice(value),
            None => buf.fill(0),
        }
        Ok(())
    }

    /// Convenience for registers that fit in 64 bits.
    pub fn read_register_u64(&self, id: RegisterId) -> Result<u64> {
        let len = self.descriptor_len(id)?.min(8);
        let mut buf = [0u8; 8];
        let mut reg = vec![0u8; self.descriptor_len(id)?];
        self.read_register(id, &mut reg)?;
        buf[..len].copy_from_slice(&reg[..len]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes `buf` into the register. A short buffer is zero- or
    /// sign-extended to the register width; a long one is a `SizeMismatch`.
    pub fn write_register(&mut self, id: RegisterId, buf: &[u8], sign_extend: bool) -> Result<()> {
        let expected = self.descriptor_len(id)?;
        if buf.len() > expected {
            return Err(Error::SizeMismatch {
                name: self.info.register_name(id).unwrap_or("?").to_owned(),
                expected,
                got: buf.len(),
            });
        }
        let mut value = vec![0u8; expected];
        value[..buf.len()].copy_from_slice(buf);
        if sign_extend && buf.len() < expected && buf.last().is_some_and(|b| b & 0x80 != 0) {
            for byte in &mut value[buf.len()..] {
                *byte = 0xff;
            }
        }
        self.registers.insert(id, value);
        Ok(())
    }

    /// Returns the register to the unset state, so later reads are treated as
    /// unknown. Used to poison registers whose value became symbolic.
    pub fn clear_register(&mut self, id: RegisterId) {
        self.registers.remove(&id);
    }

    pub fn write_register_u64(&mut self, id: RegisterId, value: u64) -> Result<()> {
        let len = self.descriptor_len(id)?.min(8);
        self.write_register(id, &value.to_le_bytes()[..len], false)
    }

    /// Records that `logical` lives at `linear` memory.
    pub fn add_mapping(&mut self, logical: Address, linear: Address) {
        self.mappings.insert(logical, linear);
    }

    /// Resolves a logical address to its linear location. Base-zero addresses
    /// without an explicit mapping are already linear.
    pub fn translate(&self, logical: &Address) -> Result<Address> {
        if let Some(linear) = self.mappings.get(logical) {
            return Ok(*linear);
        }
        if logical.base() == 0 {
            return Ok(*logical);
        }
        Err(Error::Translate(*logical))
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            registers: self.registers.clone(),
            mappings: self.mappings.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &CpuSnapshot) {
        self.registers = snapshot.registers.clone();
        self.mappings = snapshot.mappings.clone();
    }

    /// Live registers, sorted by id.
    pub fn registers(&self) -> Vec<RegisterId> {
        let mut ids: Vec<_> = self.registers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Display for CpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.registers() {
            let name = self.info.register_name(id).unwrap_or("?");
            let value = &self.registers[&id];
            write!(f, "{name} = ")?;
            for byte in value.iter().rev() {
                write!(f, "{byte:02x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Arc<CpuInformation> {
        CpuInformation::builder("test")
            .register("r0", 32)
            .register("r1", 32)
            .register("acc", 128)
            .register("pc", 32)
            .register("sp", 32)
            .role(RegisterRole::ProgramPointer, "pc")
            .role(RegisterRole::StackPointer, "sp")
            .build()
    }

    #[test]
    fn metadata_lookup() {
        let info = cpu();
        assert_eq!(info.register_id("r1"), Some(1));
        assert_eq!(info.register_name(2), Some("acc"));
        assert_eq!(info.register_bits(2), 128);
        assert_eq!(info.register_bytes(2), 16);
        assert_eq!(info.register_by_role(RegisterRole::ProgramPointer), Some(3));
        assert_eq!(info.register_id("nope"), None);
    }

    #[test]
    fn read_write_round_trip() {
        let info = cpu();
        let mut ctx = CpuContext::new(info.clone());
        assert!(!ctx.is_register_set(0));
        ctx.write_register_u64(0, 0xdead_beef).unwrap();
        assert!(ctx.is_register_set(0));
        assert_eq!(ctx.read_register_u64(0).unwrap(), 0xdead_beef);
    }

    #[test]
    fn unset_register_reads_zero() {
        let ctx = CpuContext::new(cpu());
        let mut buf = [0xaau8; 4];
        ctx.read_register(1, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn size_mismatch_and_unknown_register() {
        let mut ctx = CpuContext::new(cpu());
        let mut small = [0u8; 2];
        assert!(matches!(
            ctx.read_register(0, &mut small),
            Err(Error::SizeMismatch { .. })
        ));
        assert_eq!(
            ctx.write_register(99, &[0], false),
            Err(Error::UnknownRegister(99))
        );
    }

    #[test]
    fn write_sign_extends_short_buffers() {
        let mut ctx = CpuContext::new(cpu());
        ctx.write_register(0, &[0xfe], true).unwrap();
        assert_eq!(ctx.read_register_u64(0).unwrap(), 0xffff_fffe);
        ctx.write_register(0, &[0xfe], false).unwrap();
        assert_eq!(ctx.read_register_u64(0).unwrap(), 0xfe);
    }

    #[test]
    fn wide_register_round_trip() {
        let mut ctx = CpuContext::new(cpu());
        let value: Vec<u8> = (0u8..16).collect();
        ctx.write_register(2, &value, false).unwrap();
        let mut back = [0u8; 16];
        ctx.read_register(2, &mut back).unwrap();
        assert_eq!(back.as_slice(), value.as_slice());
    }

    #[test]
    fn translate_uses_mappings_then_flat_fallback() {
        let mut ctx = CpuContext::new(cpu());
        let logical = Address::segmented(0x10, 0x20, 16);
        assert_eq!(ctx.translate(&logical), Err(Error::Translate(logical)));
        ctx.add_mapping(logical, Address::flat(0x120));
        assert_eq!(ctx.translate(&logical).unwrap(), Address::flat(0x120));
        assert_eq!(
            ctx.translate(&Address::flat(0x999)).unwrap(),
            Address::flat(0x999)
        );
    }

    #[test]
    fn snapshot_restore() {
        let mut ctx = CpuContext::new(cpu());
        ctx.write_register_u64(0, 1).unwrap();
        let snap = ctx.snapshot();
        ctx.write_register_u64(0, 2).unwrap();
        ctx.write_register_u64(1, 3).unwrap();
        ctx.restore(&snap);
        assert_eq!(ctx.read_register_u64(0).unwrap(), 1);
        assert!(!ctx.is_register_set(1));
    }
}
