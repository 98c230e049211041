//! Flat binary loader.

use core_address::Address;
use core_document::{Access, Document, MemoryArea};

use crate::{Loader, Result};

/// Maps the whole image as one executable area at a fixed base. The fallback
/// when no structured format matches.
pub struct RawLoader {
    base: u64,
}

impl RawLoader {
    pub const DEFAULT_BASE: u64 = 0x1000;

    pub fn new(base: u64) -> Self {
        Self { base }
    }
}

impl Default for RawLoader {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE)
    }
}

impl Loader for RawLoader {
    fn name(&self) -> &str {
        "raw"
    }

    fn is_compatible(&self, bytes: &[u8]) -> bool {
        !bytes.is_empty()
    }

    fn map(&self, document: &Document, bytes: &[u8]) -> Result<()> {
        document.add_memory_area(MemoryArea::new(
            ".raw",
            Address::flat(self.base),
            bytes.to_vec(),
            Access::READ | Access::WRITE | Access::EXECUTE,
            0,
            0,
            Some(0),
        ))?;
        Ok(())
    }

    fn entry_point(&self, bytes: &[u8]) -> Option<Address> {
        (!bytes.is_empty()).then(|| Address::flat(self.base))
    }
}
