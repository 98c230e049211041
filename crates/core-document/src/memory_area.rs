//! Mapped memory regions.

use core_address::Address;

use crate::{Error, Result};

bitflags::bitflags! {
    /// Page-style access rights of a memory area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Access {
    /// Short `rwx` rendering used by listings and the text database.
    pub fn letters(&self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.contains(Access::READ) { 'r' } else { '-' });
        s.push(if self.contains(Access::WRITE) { 'w' } else { '-' });
        s.push(if self.contains(Access::EXECUTE) { 'x' } else { '-' });
        s
    }

    pub fn from_letters(s: &str) -> Option<Self> {
        let mut access = Access::empty();
        for c in s.chars() {
            match c {
                'r' => access |= Access::READ,
                'w' => access |= Access::WRITE,
                'x' => access |= Access::EXECUTE,
                '-' => {}
                _ => return None,
            }
        }
        Some(access)
    }
}

/// A contiguous mapped region. Areas are added while loading and immutable
/// afterwards; their bytes are the pristine image, runtime writes live in the
/// emulator's copy-on-write pages instead.
#[derive(Debug, Clone)]
pub struct MemoryArea {
    name: String,
    start: Address,
    size: u64,
    access: Access,
    architecture_tag: u32,
    default_mode: u8,
    /// Offset of the backing bytes inside the loaded file, when any.
    file_offset: Option<u64>,
    bytes: Vec<u8>,
    is_virtual: bool,
}

impl MemoryArea {
    pub fn new(
        name: impl Into<String>,
        start: Address,
        bytes: Vec<u8>,
        access: Access,
        architecture_tag: u32,
        default_mode: u8,
        file_offset: Option<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            start,
            size: bytes.len() as u64,
            access,
            architecture_tag,
            default_mode,
            file_offset,
            bytes,
            is_virtual: false,
        }
    }

    /// An area without backing bytes; reads yield zeroes.
    pub fn virtual_area(
        name: impl Into<String>,
        start: Address,
        size: u64,
        access: Access,
        architecture_tag: u32,
        default_mode: u8,
    ) -> Self {
        Self {
            name: name.into(),
            start,
            size,
            access,
            architecture_tag,
            default_mode,
            file_offset: None,
            bytes: Vec::new(),
            is_virtual: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last contained offset.
    pub fn end_offset(&self) -> u64 {
        self.start.offset() + self.size
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn architecture_tag(&self) -> u32 {
        self.architecture_tag
    }

    pub fn default_mode(&self) -> u8 {
        self.default_mode
    }

    pub fn file_offset(&self) -> Option<u64> {
        self.file_offset
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn contains(&self, addr: &Address) -> bool {
        addr.base() == self.start.base()
            && addr.offset() >= self.start.offset()
            && addr.offset() < self.end_offset()
    }

    pub fn linear_range(&self) -> (u64, u64) {
        let start = self.start.linear();
        (start, start + self.size)
    }

    pub fn overlaps(&self, other: &MemoryArea) -> bool {
        let (a0, a1) = self.linear_range();
        let (b0, b1) = other.linear_range();
        a0 < b1 && b0 < a1
    }

    /// Reads `len` bytes starting at `addr`. Fails with [`Error::Truncated`]
    /// when the range leaves the area; virtual areas read as zeroes.
    pub fn read(&self, addr: &Address, len: usize) -> Result<Vec<u8>> {
        if !self.contains(addr) {
            return Err(Error::NotFound(*addr));
        }
        let rel = (addr.offset() - self.start.offset()) as usize;
        let available = (self.size as usize).saturating_sub(rel);
        if available < len {
            return Err(Error::Truncated {
                address: *addr,
                wanted: len,
                got: available,
            });
        }
        if self.is_virtual {
            return Ok(vec![0; len]);
        }
        Ok(self.bytes[rel..rel + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> MemoryArea {
        MemoryArea::new(
            ".text",
            Address::flat(0x1000),
            (0u8..16).collect(),
            Access::READ | Access::EXECUTE,
            0x1234,
            0,
            Some(0x400),
        )
    }

    #[test]
    fn containment_and_ranges() {
        let a = area();
        assert!(a.contains(&Address::flat(0x1000)));
        assert!(a.contains(&Address::flat(0x100f)));
        assert!(!a.contains(&Address::flat(0x1010)));
        assert_eq!(a.linear_range(), (0x1000, 0x1010));
    }

    #[test]
    fn read_checks_bounds() {
        let a = area();
        assert_eq!(a.read(&Address::flat(0x1004), 4).unwrap(), vec![4, 5, 6, 7]);
        assert!(matches!(
            a.read(&Address::flat(0x100f), 2),
            Err(Error::Truncated { got: 1, .. })
        ));
        assert!(matches!(
            a.read(&Address::flat(0x2000), 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn virtual_area_reads_zeroes() {
        let v = MemoryArea::virtual_area(".bss", Address::flat(0x2000), 8, Access::READ, 0, 0);
        assert_eq!(v.read(&Address::flat(0x2004), 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn access_letters_round_trip() {
        let access = Access::READ | Access::EXECUTE;
        assert_eq!(access.letters(), "r-x");
        assert_eq!(Access::from_letters("r-x"), Some(access));
        assert_eq!(Access::from_letters("q"), None);
    }

    #[test]
    fn overlap_detection_is_linear() {
        let a = area();
        let b = MemoryArea::virtual_area("other", Address::flat(0x100f), 4, Access::READ, 0, 0);
        let c = MemoryArea::virtual_area("clear", Address::flat(0x1010), 4, Access::READ, 0, 0);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
