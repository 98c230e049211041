#![allow(dead_code)] // Shared across integration tests; each binary uses a subset.

use std::sync::Arc;

use core_address::Address;
use core_arch::{Architecture, MicroArchitecture};
use core_document::{Access, Document, MemoryArea};

/// Tiny assembler for the micro32 reference encoding, for building test
/// images without hand-counting offsets.
pub struct Asm {
    base: u64,
    bytes: Vec<u8>,
}

impl Asm {
    pub fn at(base: u64) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    /// Address of the next emitted byte.
    pub fn here(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    pub fn ld(mut self, rd: u8, imm: u32) -> Self {
        self.bytes.push(0x01);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    pub fn add(mut self, rd: u8, rs: u8) -> Self {
        self.bytes.extend_from_slice(&[0x02, rd, rs]);
        self
    }

    pub fn jmp(mut self, target: u64) -> Self {
        self.bytes.push(0x03);
        self.bytes.extend_from_slice(&(target as u32).to_le_bytes());
        self
    }

    pub fn call(mut self, target: u64) -> Self {
        self.bytes.push(0x04);
        self.bytes.extend_from_slice(&(target as u32).to_le_bytes());
        self
    }

    pub fn ret(mut self) -> Self {
        self.bytes.push(0x05);
        self
    }

    pub fn jz(mut self, rd: u8, target: u64) -> Self {
        self.bytes.push(0x06);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&(target as u32).to_le_bytes());
        self
    }

    pub fn st(mut self, slot: u64, rs: u8) -> Self {
        self.bytes.push(0x07);
        self.bytes.push(rs);
        self.bytes.extend_from_slice(&(slot as u32).to_le_bytes());
        self
    }

    pub fn ld_mem(mut self, rd: u8, slot: u64) -> Self {
        self.bytes.push(0x08);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&(slot as u32).to_le_bytes());
        self
    }

    pub fn nop(mut self) -> Self {
        self.bytes.push(0x09);
        self
    }

    /// Raw bytes (data, padding, deliberate garbage).
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Pads with `0xff` until `addr`, which must lie ahead.
    pub fn pad_to(mut self, addr: u64) -> Self {
        assert!(addr >= self.here(), "pad_to goes forward only");
        let fill = (addr - self.here()) as usize;
        self.bytes.extend(std::iter::repeat_n(0xff, fill));
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Maps the program as one executable area.
    pub fn into_document(self) -> Arc<Document> {
        let arch = micro();
        let doc = Document::new();
        doc.add_memory_area(MemoryArea::new(
            ".text",
            Address::flat(self.base),
            self.bytes,
            Access::READ | Access::EXECUTE,
            arch.tag(),
            0,
            Some(0),
        ))
        .unwrap();
        Arc::new(doc)
    }
}

pub fn micro() -> Arc<dyn Architecture> {
    Arc::new(MicroArchitecture::new())
}

pub fn flat(offset: u64) -> Address {
    Address::flat(offset)
}
