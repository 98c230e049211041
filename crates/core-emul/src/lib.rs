//! Interpreter-style execution of semantic expressions.
//!
//! [`MemoryContext`] gives an evaluation its own view of memory: pages
//! inherited from a [`Document`] (copied on first write), plus anonymous
//! allocations for stacks and scratch space. [`eval::Evaluator`] reduces
//! expression trees against a CPU and a memory context; [`interp::Interpreter`]
//! drives whole instructions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use core_address::Address;
use core_document::Document;
use thiserror::Error;

pub mod eval;
pub mod interp;

pub use eval::{operand_reference, EvalOutcome, Evaluator, DEFAULT_LOOP_CAP};
pub use interp::Interpreter;

#[derive(Debug, Error)]
pub enum Error {
    #[error("nothing mapped at {0}")]
    NotFound(Address),
    #[error("allocation at {0} overlaps an existing page")]
    Overlap(Address),
    #[error("allocation at {0} exceeds the address space")]
    OutOfAddress(Address),
    #[error("access truncated at {address}: wanted {wanted} bytes, got {got}")]
    Truncated {
        address: Address,
        wanted: usize,
        got: usize,
    },
    #[error(transparent)]
    Cpu(#[from] core_cpu::Error),
    #[error(transparent)]
    Visit(#[from] core_expr::VisitError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
enum PageBacking {
    /// Backed by a document memory area; bytes are materialized on first
    /// write and the pristine image stays untouched.
    Document { area_start: Address },
    Anonymous,
}

#[derive(Debug, Clone)]
struct Page {
    start: Address,
    size: u64,
    backing: PageBacking,
    /// `None` until the page diverges from its backing.
    bytes: Option<Vec<u8>>,
}

/// A paged virtual memory overlaying a document.
#[derive(Debug, Default, Clone)]
pub struct MemoryContext {
    document: Option<Arc<Document>>,
    /// Keyed by linear start.
    pages: BTreeMap<u64, Page>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors every memory area of `document` as a copy-on-write page.
    pub fn map_document(&mut self, document: Arc<Document>) {
        document.for_each_memory_area(|area| {
            let start = area.start();
            self.pages.insert(
                start.linear(),
                Page {
                    start,
                    size: area.size(),
                    backing: PageBacking::Document { area_start: start },
                    bytes: None,
                },
            );
        });
        self.document = Some(document);
    }

    /// Maps `size` fresh bytes at `addr`, optionally seeded with `data`.
    pub fn allocate(&mut self, addr: Address, size: u64, data: Option<Vec<u8>>) -> Result<()> {
        let linear = addr.linear();
        let end = linear.checked_add(size).ok_or(Error::OutOfAddress(addr))?;
        let overlaps = self
            .pages
            .values()
            .any(|p| linear < p.start.linear() + p.size && p.start.linear() < end);
        if overlaps {
            return Err(Error::Overlap(addr));
        }
        let mut bytes = data.unwrap_or_default();
        bytes.resize(size as usize, 0);
        self.pages.insert(
            linear,
            Page {
                start: addr,
                size,
                backing: PageBacking::Anonymous,
                bytes: Some(bytes),
            },
        );
        Ok(())
    }

    /// Page containing `addr`, as `(start, size)`.
    pub fn find_memory(&self, addr: &Address) -> Option<(Address, u64)> {
        self.page_at(addr.linear()).map(|p| (p.start, p.size))
    }

    fn page_at(&self, linear: u64) -> Option<&Page> {
        let (_, page) = self.pages.range(..=linear).next_back()?;
        (linear < page.start.linear() + page.size).then_some(page)
    }

    /// Fills `buf` from `addr`. A range leaving the page is a
    /// [`Error::Truncated`] and nothing is copied.
    pub fn read_memory(&self, addr: &Address, buf: &mut [u8]) -> Result<()> {
        let linear = addr.linear();
        let page = self.page_at(linear).ok_or(Error::NotFound(*addr))?;
        let rel = (linear - page.start.linear()) as usize;
        let available = (page.size as usize).saturating_sub(rel);
        if available < buf.len() {
            return Err(Error::Truncated {
                address: *addr,
                wanted: buf.len(),
                got: available,
            });
        }
        match (&page.bytes, &page.backing) {
            (Some(bytes), _) => buf.copy_from_slice(&bytes[rel..rel + buf.len()]),
            (None, PageBacking::Document { area_start }) => {
                let doc = self.document.as_ref().ok_or(Error::NotFound(*addr))?;
                let doc_addr = area_start.move_by(rel as i64);
                let data = doc
                    .read_memory(&doc_addr, buf.len())
                    .map_err(|_| Error::NotFound(*addr))?;
                buf.copy_from_slice(&data);
            }
            (None, PageBacking::Anonymous) => buf.fill(0),
        }
        Ok(())
    }

    pub fn read_u64(&self, addr: &Address, nbytes: usize) -> Result<u64> {
        debug_assert!(nbytes <= 8);
        let mut buf = vec![0u8; nbytes];
        self.read_memory(addr, &mut buf)?;
        let mut wide = [0u8; 8];
        wide[..nbytes].copy_from_slice(&buf);
        Ok(u64::from_le_bytes(wide))
    }

    /// Writes `data` at `addr`, materializing a copy of document-backed pages
    /// first.
    pub fn write_memory(&mut self, addr: &Address, data: &[u8]) -> Result<()> {
        let linear = addr.linear();
        let document = self.document.clone();
        let (page_start, page) = {
            let (start, page) = self
                .pages
                .range_mut(..=linear)
                .next_back()
                .ok_or(Error::NotFound(*addr))?;
            if linear >= page.start.linear() + page.size {
                return Err(Error::NotFound(*addr));
            }
            (*start, page)
        };
        let rel = (linear - page_start) as usize;
        let available = (page.size as usize).saturating_sub(rel);
        if available < data.len() {
            return Err(Error::Truncated {
                address: *addr,
                wanted: data.len(),
                got: available,
            });
        }
        if page.bytes.is_none() {
            let mut snapshot = vec![0u8; page.size as usize];
            if let PageBacking::Document { area_start } = &page.backing {
                let doc = document.ok_or(Error::NotFound(*addr))?;
                if let Ok(bytes) = doc.read_memory(area_start, page.size as usize) {
                    snapshot.copy_from_slice(&bytes);
                }
            }
            page.bytes = Some(snapshot);
        }
        let bytes = page.bytes.as_mut().expect("just materialized");
        bytes[rel..rel + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn write_u64(&mut self, addr: &Address, value: u64, nbytes: usize) -> Result<()> {
        debug_assert!(nbytes <= 8);
        self.write_memory(addr, &value.to_le_bytes()[..nbytes])
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl fmt::Display for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for page in self.pages.values() {
            let kind = match page.backing {
                PageBacking::Document { .. } => "document",
                PageBacking::Anonymous => "anonymous",
            };
            let state = if page.bytes.is_some() { "private" } else { "shared" };
            writeln!(
                f,
                "{} + {:#x} ({kind}, {state})",
                page.start, page.size
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_document::{Access, MemoryArea};

    fn doc() -> Arc<Document> {
        let doc = Document::new();
        doc.add_memory_area(MemoryArea::new(
            ".text",
            Address::flat(0x1000),
            (0u8..16).collect(),
            Access::READ | Access::EXECUTE,
            1,
            0,
            Some(0),
        ))
        .unwrap();
        Arc::new(doc)
    }

    #[test]
    fn reads_fall_through_to_the_document() {
        let mut mem = MemoryContext::new();
        mem.map_document(doc());
        assert_eq!(mem.read_u64(&Address::flat(0x1004), 4).unwrap(), 0x07060504);
        assert_eq!(
            mem.find_memory(&Address::flat(0x100f)),
            Some((Address::flat(0x1000), 16))
        );
    }

    #[test]
    fn writes_are_copy_on_write() {
        let document = doc();
        let mut mem = MemoryContext::new();
        mem.map_document(document.clone());
        mem.write_u64(&Address::flat(0x1000), 0xff, 1).unwrap();
        assert_eq!(mem.read_u64(&Address::flat(0x1000), 1).unwrap(), 0xff);
        // Bytes after the write keep their image values in the copy.
        assert_eq!(mem.read_u64(&Address::flat(0x1001), 1).unwrap(), 1);
        // The pristine image is untouched.
        assert_eq!(document.read_memory(&Address::flat(0x1000), 1).unwrap(), vec![0]);
    }

    #[test]
    fn allocation_checks_overlap_and_address_space() {
        let mut mem = MemoryContext::new();
        mem.map_document(doc());
        mem.allocate(Address::flat(0x2000_0000), 0x1000, None).unwrap();
        assert!(matches!(
            mem.allocate(Address::flat(0x2000_0800), 0x1000, None),
            Err(Error::Overlap(_))
        ));
        assert!(matches!(
            mem.allocate(Address::flat(0x1008), 4, None),
            Err(Error::Overlap(_))
        ));
        assert!(matches!(
            mem.allocate(Address::flat(u64::MAX), 2, None),
            Err(Error::OutOfAddress(_))
        ));
    }

    #[test]
    fn short_reads_are_truncated() {
        let mut mem = MemoryContext::new();
        mem.map_document(doc());
        let mut buf = [0u8; 4];
        assert!(matches!(
            mem.read_memory(&Address::flat(0x100e), &mut buf),
            Err(Error::Truncated { got: 2, .. })
        ));
        assert!(matches!(
            mem.read_memory(&Address::flat(0x5000), &mut buf),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn anonymous_pages_read_zero_until_written() {
        let mut mem = MemoryContext::new();
        mem.allocate(Address::flat(0x9000), 16, Some(vec![1, 2, 3])).unwrap();
        assert_eq!(mem.read_u64(&Address::flat(0x9000), 2).unwrap(), 0x0201);
        assert_eq!(mem.read_u64(&Address::flat(0x9004), 4).unwrap(), 0);
    }
}
