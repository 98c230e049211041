//! The in-memory model of a disassembled program.
//!
//! [`Document`] is the single source of truth for every address-keyed fact:
//! memory areas, cells, multi-cells, labels, cross-references, comments,
//! detail records and the navigation history. Mutations are serialized per
//! submap behind reader-writer locks and publish typed change events once
//! committed.
//!
//! Lock order, where a mutation needs more than one submap: memory areas,
//! then cells, multicells, labels, xrefs. Events always fire after every
//! guard has been released.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, RwLock};

use core_address::Address;
use thiserror::Error;
use tracing::{debug, warn};

pub mod cell;
pub mod detail;
pub mod event;
pub mod history;
pub mod label;
pub mod memory_area;
pub mod multicell;
pub mod xref;

pub use cell::{Cell, CellData, CellKind, Instruction, InstructionFlags};
pub use detail::{
    BasicBlock, ControlFlowGraph, DetailStore, EdgeKind, FunctionDetail, Id, Parameter,
    StructureDetail, ValueDetail,
};
pub use event::{DocumentEvent, EventHub, EventMask, TaskStatus};
pub use history::{AddressHistory, DEFAULT_HISTORY_CAPACITY};
pub use label::{Label, LabelFlags, LabelStore};
pub use memory_area::{Access, MemoryArea};
pub use multicell::{MultiCell, MultiCellKind};
pub use xref::CrossReferences;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("nothing known at {0}")]
    NotFound(Address),
    #[error("conflicting cell or label at {0}")]
    Conflict(Address),
    #[error("range at {0} overlaps an existing one")]
    Overlap(Address),
    #[error("read truncated at {address}: wanted {wanted} bytes, got {got}")]
    Truncated {
        address: Address,
        wanted: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Character encodings understood by string detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii,
    Utf16,
}

impl StringEncoding {
    /// Stored in [`CellData::subtype`] of character cells.
    pub fn code(&self) -> u8 {
        match self {
            StringEncoding::Ascii => 1,
            StringEncoding::Utf16 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StringEncoding::Ascii),
            2 => Some(StringEncoding::Utf16),
            _ => None,
        }
    }

    pub fn char_width(&self) -> usize {
        match self {
            StringEncoding::Ascii => 1,
            StringEncoding::Utf16 => 2,
        }
    }
}

#[derive(Debug)]
pub struct Document {
    areas: RwLock<BTreeMap<Address, MemoryArea>>,
    cells: RwLock<BTreeMap<Address, Cell>>,
    multicells: RwLock<BTreeMap<Address, MultiCell>>,
    labels: RwLock<LabelStore>,
    xrefs: RwLock<CrossReferences>,
    comments: RwLock<BTreeMap<Address, String>>,
    details: RwLock<DetailStore>,
    history: Mutex<AddressHistory>,
    hub: EventHub,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            areas: RwLock::new(BTreeMap::new()),
            cells: RwLock::new(BTreeMap::new()),
            multicells: RwLock::new(BTreeMap::new()),
            labels: RwLock::new(LabelStore::new()),
            xrefs: RwLock::new(CrossReferences::new()),
            comments: RwLock::new(BTreeMap::new()),
            details: RwLock::new(DetailStore::default()),
            history: Mutex::new(AddressHistory::new(capacity)),
            hub: EventHub::new(),
        }
    }

    // ---------------------------------------------------------------- events

    pub fn subscribe(&self, mask: EventMask) -> crossbeam_channel::Receiver<DocumentEvent> {
        self.hub.subscribe(mask)
    }

    pub fn notify_task(&self, name: &str, status: TaskStatus) {
        self.hub.publish(DocumentEvent::TaskUpdated {
            name: name.to_owned(),
            status,
        });
    }

    pub fn notify_quit(&self) {
        self.hub.publish(DocumentEvent::Quit);
    }

    // ---------------------------------------------------------- memory areas

    /// Adds a memory area; fails with [`Error::Overlap`] when its linear range
    /// intersects an existing area.
    pub fn add_memory_area(&self, area: MemoryArea) -> Result<()> {
        let (name, start) = (area.name().to_owned(), area.start());
        {
            let mut areas = self.areas.write().expect("areas lock");
            if areas.values().any(|existing| existing.overlaps(&area)) {
                return Err(Error::Overlap(start));
            }
            areas.insert(start, area);
        }
        debug!(target: "doc", area = %name, %start, "memory area added");
        self.hub.publish_all([
            DocumentEvent::MemoryAreaUpdated {
                name,
                start,
                removed: false,
            },
            DocumentEvent::DocumentUpdated,
        ]);
        Ok(())
    }

    pub fn for_each_memory_area(&self, mut f: impl FnMut(&MemoryArea)) {
        let areas = self.areas.read().expect("areas lock");
        for area in areas.values() {
            f(area);
        }
    }

    pub fn memory_area_count(&self) -> usize {
        self.areas.read().expect("areas lock").len()
    }

    fn area_containing<'a>(
        areas: &'a BTreeMap<Address, MemoryArea>,
        addr: &Address,
    ) -> Option<(Address, &'a MemoryArea)> {
        let (start, area) = areas.range(..=*addr).next_back()?;
        area.contains(addr).then_some((*start, area))
    }

    /// Reads pristine image bytes. Partial availability is a
    /// [`Error::Truncated`].
    pub fn read_memory(&self, addr: &Address, len: usize) -> Result<Vec<u8>> {
        let areas = self.areas.read().expect("areas lock");
        let (_, area) = Self::area_containing(&areas, addr).ok_or(Error::NotFound(*addr))?;
        area.read(addr, len)
    }

    /// Bytes available from `addr` to the end of its area.
    pub fn read_memory_upto(&self, addr: &Address, len: usize) -> Result<Vec<u8>> {
        let areas = self.areas.read().expect("areas lock");
        let (_, area) = Self::area_containing(&areas, addr).ok_or(Error::NotFound(*addr))?;
        let available = (area.end_offset() - addr.offset()) as usize;
        area.read(addr, len.min(available))
    }

    pub fn is_mapped(&self, addr: &Address) -> bool {
        let areas = self.areas.read().expect("areas lock");
        Self::area_containing(&areas, addr).is_some()
    }

    pub fn convert_address_to_file_offset(&self, addr: &Address) -> Result<u64> {
        let areas = self.areas.read().expect("areas lock");
        let (_, area) = Self::area_containing(&areas, addr).ok_or(Error::NotFound(*addr))?;
        let base = area.file_offset().ok_or(Error::NotFound(*addr))?;
        Ok(base + (addr.offset() - area.start().offset()))
    }

    /// Architecture owning `addr`: the cell's tag when set, the area default
    /// otherwise.
    pub fn architecture_tag(&self, addr: &Address) -> Option<u32> {
        if let Some(cell) = self.cell(addr) {
            if cell.data().architecture_tag != 0 {
                return Some(cell.data().architecture_tag);
            }
        }
        let areas = self.areas.read().expect("areas lock");
        Self::area_containing(&areas, addr).map(|(_, a)| a.architecture_tag())
    }

    pub fn mode(&self, addr: &Address) -> Option<u8> {
        if let Some(cell) = self.cell(addr) {
            if cell.kind() != CellKind::Unknown {
                return Some(cell.data().mode);
            }
        }
        let areas = self.areas.read().expect("areas lock");
        Self::area_containing(&areas, addr).map(|(_, a)| a.default_mode())
    }

    // ------------------------------------------------------------------ cells

    fn covering_cell(
        cells: &BTreeMap<Address, Cell>,
        area_start: &Address,
        addr: &Address,
    ) -> Option<(Address, Cell)> {
        let (start, cell) = cells.range(*area_start..=*addr).next_back()?;
        let end = start.offset() + cell.length() as u64;
        (start.base() == addr.base() && addr.offset() < end).then(|| (*start, cell.clone()))
    }

    /// The cell covering `addr`. Mapped bytes without an explicit cell yield
    /// a synthesized one-byte unknown cell; unmapped addresses yield `None`.
    pub fn cell(&self, addr: &Address) -> Option<Cell> {
        let areas = self.areas.read().expect("areas lock");
        let (area_start, _) = Self::area_containing(&areas, addr)?;
        drop(areas);
        let cells = self.cells.read().expect("cells lock");
        match Self::covering_cell(&cells, &area_start, addr) {
            Some((_, cell)) => Some(cell),
            None => Some(Cell::unknown()),
        }
    }

    pub fn cell_kind(&self, addr: &Address) -> Option<CellKind> {
        self.cell(addr).map(|c| c.kind())
    }

    pub fn contains_code(&self, addr: &Address) -> bool {
        self.cell_kind(addr) == Some(CellKind::Instruction)
    }

    pub fn contains_data(&self, addr: &Address) -> bool {
        matches!(
            self.cell_kind(addr),
            Some(CellKind::Value | CellKind::Character | CellKind::String)
        )
    }

    pub fn contains_unknown(&self, addr: &Address) -> bool {
        self.cell_kind(addr) == Some(CellKind::Unknown)
    }

    /// Cells whose range intersects `[addr, addr + len)`.
    fn overlapped_cells(
        cells: &BTreeMap<Address, Cell>,
        area_start: &Address,
        addr: &Address,
        len: u64,
    ) -> Vec<Address> {
        let mut out = Vec::new();
        if let Some((start, _)) = Self::covering_cell(cells, area_start, addr) {
            out.push(start);
        }
        let end = addr.move_by(len as i64);
        for (start, _) in cells.range((Bound::Excluded(*addr), Bound::Excluded(end))) {
            if out.last() != Some(start) {
                out.push(*start);
            }
        }
        out
    }

    /// Installs `cell` at `addr`.
    ///
    /// Without `force` any differing overlapped cell is a [`Error::Conflict`]
    /// and nothing changes. With `force` every overlapped cell is erased
    /// first, together with the cross-references touching those addresses.
    pub fn set_cell(&self, addr: &Address, cell: Cell, force: bool) -> Result<()> {
        let len = cell.length().max(1) as u64;
        let area_start = {
            let areas = self.areas.read().expect("areas lock");
            let (start, area) = Self::area_containing(&areas, addr).ok_or(Error::NotFound(*addr))?;
            if addr.offset() + len > area.end_offset() {
                return Err(Error::Overlap(*addr));
            }
            start
        };

        let mut events = Vec::new();
        {
            let mut cells = self.cells.write().expect("cells lock");
            let overlapped = Self::overlapped_cells(&cells, &area_start, addr, len);
            // Overwriting the cell that starts exactly here is a replacement;
            // any other overlapped cell is a genuine conflict.
            let conflicting = overlapped.iter().any(|start| start != addr);
            if conflicting {
                if !force {
                    return Err(Error::Conflict(*addr));
                }
                let mut xrefs = self.xrefs.write().expect("xrefs lock");
                for start in &overlapped {
                    cells.remove(start);
                    xrefs.remove_address(start);
                }
            }
            cells.insert(*addr, cell);

            let mut affected = overlapped;
            if affected.last() != Some(addr) && !affected.contains(addr) {
                affected.push(*addr);
            }
            events.push(DocumentEvent::AddressUpdated(affected));
            events.push(DocumentEvent::DocumentUpdated);
        }
        self.hub.publish_all(events);
        Ok(())
    }

    /// Removes the cell starting at `addr`: its cross-references go away, an
    /// enclosing multi-cell is unbound, and the address loses its label.
    pub fn delete_cell(&self, addr: &Address) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut cells = self.cells.write().expect("cells lock");
            if cells.remove(addr).is_none() {
                return Err(Error::NotFound(*addr));
            }
            let mut multicells = self.multicells.write().expect("multicells lock");
            let enclosing = multicells
                .range(..=*addr)
                .next_back()
                .filter(|(start, mc)| {
                    start.base() == addr.base() && addr.offset() < start.offset() + mc.size
                })
                .map(|(start, _)| *start);
            if let Some(start) = enclosing {
                multicells.remove(&start);
            }
            let mut labels = self.labels.write().expect("labels lock");
            if let Some(label) = labels.remove(addr) {
                events.push(DocumentEvent::LabelUpdated {
                    address: *addr,
                    label,
                    removed: true,
                });
            }
            let mut xrefs = self.xrefs.write().expect("xrefs lock");
            xrefs.remove_address(addr);

            events.insert(0, DocumentEvent::AddressUpdated(vec![*addr]));
            events.push(DocumentEvent::DocumentUpdated);
        }
        self.hub.publish_all(events);
        Ok(())
    }

    /// Resizes the Value cell at `addr` to 8, 16, 32 or 64 bits.
    pub fn change_value_size(&self, addr: &Address, new_bits: u8, force: bool) -> Result<()> {
        if !matches!(new_bits, 8 | 16 | 32 | 64) {
            return Err(Error::Conflict(*addr));
        }
        {
            let cells = self.cells.read().expect("cells lock");
            match cells.get(addr) {
                Some(cell) if cell.kind() == CellKind::Value => {}
                Some(_) => return Err(Error::Conflict(*addr)),
                None => return Err(Error::NotFound(*addr)),
            }
        }
        self.set_cell(addr, Cell::value((new_bits / 8) as u16), force)
    }

    /// Snapshot of every explicit cell's descriptor, sorted by address.
    pub fn for_each_cell(&self, mut f: impl FnMut(&Address, &CellData)) {
        let cells = self.cells.read().expect("cells lock");
        for (addr, cell) in cells.iter() {
            f(addr, cell.data());
        }
    }

    // ------------------------------------------------------------ multi-cells

    pub fn multi_cell(&self, addr: &Address) -> Option<MultiCell> {
        self.multicells
            .read()
            .expect("multicells lock")
            .get(addr)
            .cloned()
    }

    pub fn set_multi_cell(&self, addr: &Address, multi_cell: MultiCell, force: bool) -> Result<()> {
        {
            let mut multicells = self.multicells.write().expect("multicells lock");
            if multicells.contains_key(addr) && !force {
                return Err(Error::Conflict(*addr));
            }
            multicells.insert(*addr, multi_cell);
        }
        self.hub.publish_all([
            DocumentEvent::AddressUpdated(vec![*addr]),
            DocumentEvent::DocumentUpdated,
        ]);
        Ok(())
    }

    pub fn remove_multi_cell(&self, addr: &Address) -> Result<()> {
        let removed = self
            .multicells
            .write()
            .expect("multicells lock")
            .remove(addr)
            .is_some();
        if !removed {
            return Err(Error::NotFound(*addr));
        }
        self.hub.publish(DocumentEvent::DocumentUpdated);
        Ok(())
    }

    pub fn for_each_multi_cell(&self, mut f: impl FnMut(&Address, &MultiCell)) {
        let multicells = self.multicells.read().expect("multicells lock");
        for (addr, mc) in multicells.iter() {
            f(addr, mc);
        }
    }

    // ---------------------------------------------------------------- strings

    /// Decodes the printable run at `addr` without committing anything.
    /// Returns the text and whether a terminator ended the run.
    pub fn scan_string(
        &self,
        addr: &Address,
        encoding: StringEncoding,
        max_len: usize,
    ) -> Result<(String, bool)> {
        let bytes = self.read_memory_upto(addr, max_len.max(1) * encoding.char_width())?;
        Ok(decode_printable_run(&bytes, encoding))
    }

    /// Detects a terminated character run at `addr` and commits Character
    /// cells, a String multi-cell and a `str_…` label for it. Invoking it
    /// again on the same address is a no-op.
    pub fn make_string(
        &self,
        addr: &Address,
        encoding: StringEncoding,
        max_len: usize,
    ) -> Result<()> {
        if let Some(mc) = self.multi_cell(addr) {
            if mc.kind == MultiCellKind::String {
                return Ok(());
            }
        }

        let width = encoding.char_width();
        let (text, terminated) = self.scan_string(addr, encoding, max_len)?;
        if text.is_empty() || !terminated {
            return Err(Error::NotFound(*addr));
        }

        let char_count = text.chars().count() + 1; // terminator included
        let total = (char_count * width) as u64;
        let area_start = {
            let areas = self.areas.read().expect("areas lock");
            Self::area_containing(&areas, addr)
                .map(|(s, _)| s)
                .ok_or(Error::NotFound(*addr))?
        };

        let mut events = Vec::new();
        {
            let mut cells = self.cells.write().expect("cells lock");
            let overlapped = Self::overlapped_cells(&cells, &area_start, addr, total);
            for start in &overlapped {
                cells.remove(start);
            }
            let mut affected = Vec::with_capacity(char_count);
            for i in 0..char_count {
                let at = addr.move_by((i * width) as i64);
                cells.insert(at, Cell::character(encoding.code(), width as u16));
                affected.push(at);
            }
            let mut multicells = self.multicells.write().expect("multicells lock");
            multicells.insert(*addr, MultiCell::new(MultiCellKind::String, total));

            let mut labels = self.labels.write().expect("labels lock");
            let label = Label::string(string_label_name(&text));
            match labels.insert(*addr, label.clone(), false) {
                Ok(_) => events.push(DocumentEvent::LabelUpdated {
                    address: *addr,
                    label,
                    removed: false,
                }),
                // A competing label wins; the string itself is still made.
                Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }

            events.insert(0, DocumentEvent::AddressUpdated(affected));
            events.push(DocumentEvent::DocumentUpdated);
        }
        debug!(target: "doc", %addr, len = total, "string created");
        self.hub.publish_all(events);
        Ok(())
    }

    // ----------------------------------------------------------------- labels

    pub fn label_at(&self, addr: &Address) -> Option<Label> {
        self.labels.read().expect("labels lock").get(addr).cloned()
    }

    pub fn address_of_label(&self, name: &str) -> Option<Address> {
        self.labels.read().expect("labels lock").address_of(name)
    }

    pub fn add_label(&self, addr: &Address, label: Label, force: bool) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut labels = self.labels.write().expect("labels lock");
            let had = labels.get(addr) == Some(&label);
            let evicted = labels.insert(*addr, label.clone(), force)?;
            if had {
                return Ok(());
            }
            for (evicted_addr, evicted_label) in evicted {
                events.push(DocumentEvent::LabelUpdated {
                    address: evicted_addr,
                    label: evicted_label,
                    removed: true,
                });
            }
            events.push(DocumentEvent::LabelUpdated {
                address: *addr,
                label,
                removed: false,
            });
            events.push(DocumentEvent::DocumentUpdated);
        }
        self.hub.publish_all(events);
        Ok(())
    }

    pub fn remove_label(&self, addr: &Address) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut labels = self.labels.write().expect("labels lock");
            let label = labels.remove(addr).ok_or(Error::NotFound(*addr))?;
            events.push(DocumentEvent::LabelUpdated {
                address: *addr,
                label,
                removed: true,
            });
            events.push(DocumentEvent::DocumentUpdated);
        }
        self.hub.publish_all(events);
        Ok(())
    }

    /// Walks every label over a consistent snapshot. The callback may call
    /// back into label mutations; they apply immediately and do not disturb
    /// the walk.
    pub fn for_each_label(&self, mut f: impl FnMut(&Address, &Label)) {
        let snapshot = self.labels.read().expect("labels lock").snapshot();
        for (addr, label) in &snapshot {
            f(addr, label);
        }
    }

    pub fn label_count(&self) -> usize {
        self.labels.read().expect("labels lock").len()
    }

    // ----------------------------------------------------- cross-references

    /// Records that `from` references `to`. Idempotent.
    pub fn add_cross_reference(&self, to: Address, from: Address) {
        self.xrefs.write().expect("xrefs lock").add(to, from);
    }

    pub fn remove_cross_reference(&self, from: &Address) -> bool {
        self.xrefs.write().expect("xrefs lock").remove_from(from)
    }

    pub fn cross_references_from(&self, to: &Address) -> Vec<Address> {
        self.xrefs.read().expect("xrefs lock").from(to)
    }

    pub fn cross_reference_to(&self, from: &Address) -> Option<Address> {
        self.xrefs.read().expect("xrefs lock").to(from)
    }

    pub fn has_cross_reference_from(&self, to: &Address) -> bool {
        self.xrefs.read().expect("xrefs lock").has_from(to)
    }

    pub fn has_cross_reference_to(&self, from: &Address) -> bool {
        self.xrefs.read().expect("xrefs lock").has_to(from)
    }

    pub fn for_each_cross_reference(&self, mut f: impl FnMut(&Address, &[Address])) {
        let snapshot = self.xrefs.read().expect("xrefs lock").snapshot();
        for (to, froms) in &snapshot {
            f(to, froms);
        }
    }

    // --------------------------------------------------------------- comments

    pub fn set_comment(&self, addr: &Address, text: impl Into<String>) {
        self.comments
            .write()
            .expect("comments lock")
            .insert(*addr, text.into());
        self.hub.publish(DocumentEvent::DocumentUpdated);
    }

    pub fn comment(&self, addr: &Address) -> Option<String> {
        self.comments
            .read()
            .expect("comments lock")
            .get(addr)
            .cloned()
    }

    pub fn for_each_comment(&self, mut f: impl FnMut(&Address, &str)) {
        let comments = self.comments.read().expect("comments lock");
        for (addr, text) in comments.iter() {
            f(addr, text);
        }
    }

    // ---------------------------------------------------------------- details

    pub fn function_detail(&self, id: &Id) -> Option<FunctionDetail> {
        self.details
            .read()
            .expect("details lock")
            .function(id)
            .cloned()
    }

    pub fn set_function_detail(&self, id: Id, detail: FunctionDetail) {
        self.details
            .write()
            .expect("details lock")
            .set_function(id, detail);
    }

    pub fn value_detail(&self, id: &Id) -> Option<ValueDetail> {
        self.details.read().expect("details lock").value(id).cloned()
    }

    pub fn set_value_detail(&self, id: Id, detail: ValueDetail) {
        self.details
            .write()
            .expect("details lock")
            .set_value(id, detail);
    }

    pub fn structure_detail(&self, id: &Id) -> Option<StructureDetail> {
        self.details
            .read()
            .expect("details lock")
            .structure(id)
            .cloned()
    }

    pub fn set_structure_detail(&self, id: Id, detail: StructureDetail) {
        self.details
            .write()
            .expect("details lock")
            .set_structure(id, detail);
    }

    pub fn retrieve_detail_id(&self, addr: &Address, index: u8) -> Option<Id> {
        self.details.read().expect("details lock").binding(addr, index)
    }

    pub fn bind_detail_id(&self, addr: Address, index: u8, id: Id) {
        self.details.write().expect("details lock").bind(addr, index, id);
    }

    pub fn unbind_detail_id(&self, addr: &Address, index: u8) -> bool {
        self.details.write().expect("details lock").unbind(addr, index)
    }

    // ---------------------------------------------------------------- history

    pub fn insert_address_in_history(&self, addr: Address) {
        self.history.lock().expect("history lock").insert(addr);
    }

    pub fn previous_address_in_history(&self) -> Option<Address> {
        self.history.lock().expect("history lock").previous()
    }

    pub fn next_address_in_history(&self) -> Option<Address> {
        self.history.lock().expect("history lock").next()
    }

    // ------------------------------------------------------- address walking

    /// First mapped address of the document.
    pub fn first_address(&self) -> Option<Address> {
        let areas = self.areas.read().expect("areas lock");
        areas.values().next().map(|a| a.start())
    }

    /// Start of the last cell of the last area (the last unknown byte when no
    /// explicit cell reaches the end).
    pub fn last_address(&self) -> Option<Address> {
        let areas = self.areas.read().expect("areas lock");
        let (start, area) = areas.iter().next_back()?;
        let last_byte = start.move_by(area.size() as i64 - 1);
        let cells = self.cells.read().expect("cells lock");
        Some(match Self::covering_cell(&cells, start, &last_byte) {
            Some((cell_start, _)) => cell_start,
            None => last_byte,
        })
    }

    /// Start of the next cell after the one covering `addr`, crossing into
    /// the next area at a boundary.
    pub fn next_address(&self, addr: &Address) -> Option<Address> {
        let areas = self.areas.read().expect("areas lock");
        let (area_start, area) = Self::area_containing(&areas, addr)?;
        let cells = self.cells.read().expect("cells lock");
        let next_offset = match Self::covering_cell(&cells, &area_start, addr) {
            Some((start, cell)) => start.offset() + cell.length() as u64,
            None => addr.offset() + 1,
        };
        if next_offset < area.end_offset() {
            return Some(area_start.move_by((next_offset - area_start.offset()) as i64));
        }
        areas
            .range((Bound::Excluded(area_start), Bound::Unbounded))
            .next()
            .map(|(start, _)| *start)
    }

    /// Start of the cell preceding `addr`, crossing into the previous area at
    /// a boundary.
    pub fn previous_address(&self, addr: &Address) -> Option<Address> {
        let areas = self.areas.read().expect("areas lock");
        let (area_start, _) = Self::area_containing(&areas, addr)?;
        let cells = self.cells.read().expect("cells lock");
        if *addr == area_start {
            let (prev_start, prev_area) = areas.range(..area_start).next_back()?;
            let last_byte = prev_start.move_by(prev_area.size() as i64 - 1);
            return Some(match Self::covering_cell(&cells, prev_start, &last_byte) {
                Some((cell_start, _)) => cell_start,
                None => last_byte,
            });
        }
        let before = addr.move_by(-1);
        Some(match Self::covering_cell(&cells, &area_start, &before) {
            Some((cell_start, _)) => cell_start,
            None => before,
        })
    }

    /// Snaps `addr` to the start of the cell covering it; unmapped addresses
    /// snap to the nearest area boundary.
    pub fn nearest_address(&self, addr: &Address) -> Option<Address> {
        let areas = self.areas.read().expect("areas lock");
        if let Some((area_start, _)) = Self::area_containing(&areas, addr) {
            let cells = self.cells.read().expect("cells lock");
            return Some(match Self::covering_cell(&cells, &area_start, addr) {
                Some((cell_start, _)) => cell_start,
                None => *addr,
            });
        }
        if let Some((start, _)) = areas
            .range((Bound::Excluded(*addr), Bound::Unbounded))
            .next()
        {
            return Some(*start);
        }
        drop(areas);
        self.last_address()
    }

    /// Walks `delta` cells forward or backward from `addr`.
    pub fn move_address(&self, addr: &Address, delta: i64) -> Option<Address> {
        let mut current = self.nearest_address(addr)?;
        if delta >= 0 {
            for _ in 0..delta {
                current = self.next_address(&current)?;
            }
        } else {
            for _ in 0..delta.unsigned_abs() {
                current = self.previous_address(&current)?;
            }
        }
        Some(current)
    }

    // ---------------------------------------------------- position counting

    /// Number of cell positions inside `area`, or, with `upto`, the position
    /// of `upto` relative to the area start. `upto` must be a cell start or
    /// an unknown byte.
    fn positions_in_area(
        cells: &BTreeMap<Address, Cell>,
        area: &MemoryArea,
        upto: Option<&Address>,
    ) -> Option<usize> {
        let mut position = 0usize;
        let mut cursor = area.start().offset();
        let area_end = area.start().move_by(area.size() as i64);
        for (start, cell) in cells.range(area.start()..area_end) {
            if let Some(target) = upto {
                if target.offset() < start.offset() {
                    if target.offset() < cursor {
                        return None; // inside the previous cell
                    }
                    return Some(position + (target.offset() - cursor) as usize);
                }
                if target.offset() == start.offset() {
                    return Some(position + (start.offset() - cursor) as usize);
                }
            }
            position += (start.offset() - cursor) as usize + 1;
            cursor = start.offset() + cell.length() as u64;
        }
        match upto {
            Some(target) => {
                if target.offset() < cursor {
                    return None;
                }
                Some(position + (target.offset() - cursor) as usize)
            }
            None => Some(position + (area.end_offset() - cursor) as usize),
        }
    }

    /// Dense 0-based position of `addr` over the sequence of cell-bearing
    /// addresses, for UI scrollbars.
    pub fn convert_address_to_position(&self, addr: &Address) -> Option<usize> {
        let areas = self.areas.read().expect("areas lock");
        let cells = self.cells.read().expect("cells lock");
        let mut position = 0usize;
        for area in areas.values() {
            if area.contains(addr) {
                return Self::positions_in_area(&cells, area, Some(addr))
                    .map(|inner| position + inner);
            }
            position += Self::positions_in_area(&cells, area, None)?;
        }
        None
    }

    pub fn convert_position_to_address(&self, position: usize) -> Option<Address> {
        let areas = self.areas.read().expect("areas lock");
        let cells = self.cells.read().expect("cells lock");
        let mut remaining = position;
        for area in areas.values() {
            let count = Self::positions_in_area(&cells, area, None)?;
            if remaining >= count {
                remaining -= count;
                continue;
            }
            let area_end = area.start().move_by(area.size() as i64);
            let mut cursor = area.start().offset();
            for (start, cell) in cells.range(area.start()..area_end) {
                let gap = (start.offset() - cursor) as usize;
                if remaining < gap {
                    return Some(area.start().move_by(
                        (cursor - area.start().offset()) as i64 + remaining as i64,
                    ));
                }
                remaining -= gap;
                if remaining == 0 {
                    return Some(*start);
                }
                remaining -= 1;
                cursor = start.offset() + cell.length() as u64;
            }
            return Some(
                area.start()
                    .move_by((cursor - area.start().offset()) as i64 + remaining as i64),
            );
        }
        None
    }

    pub fn address_count(&self) -> usize {
        let areas = self.areas.read().expect("areas lock");
        let cells = self.cells.read().expect("cells lock");
        areas
            .values()
            .filter_map(|area| Self::positions_in_area(&cells, area, None))
            .sum()
    }

    // ---------------------------------------------------------------- erasure

    /// Clears every submap, announcing each removed memory area.
    pub fn remove_all(&self) {
        let mut events = Vec::new();
        {
            let mut areas = self.areas.write().expect("areas lock");
            for area in areas.values() {
                events.push(DocumentEvent::MemoryAreaUpdated {
                    name: area.name().to_owned(),
                    start: area.start(),
                    removed: true,
                });
            }
            areas.clear();
            self.cells.write().expect("cells lock").clear();
            self.multicells.write().expect("multicells lock").clear();
            *self.labels.write().expect("labels lock") = LabelStore::new();
            self.xrefs.write().expect("xrefs lock").clear();
            self.comments.write().expect("comments lock").clear();
            *self.details.write().expect("details lock") = DetailStore::default();
        }
        events.push(DocumentEvent::DocumentUpdated);
        warn!(target: "doc", "document cleared");
        self.hub.publish_all(events);
    }
}

/// Decodes printable characters until a terminator. Returns the text and
/// whether the terminator was actually reached.
fn decode_printable_run(bytes: &[u8], encoding: StringEncoding) -> (String, bool) {
    let mut text = String::new();
    match encoding {
        StringEncoding::Ascii => {
            for &b in bytes {
                if b == 0 {
                    return (text, true);
                }
                if !(0x20..=0x7e).contains(&b) {
                    return (text, false);
                }
                text.push(b as char);
            }
        }
        StringEncoding::Utf16 => {
            for chunk in bytes.chunks_exact(2) {
                let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
                if unit == 0 {
                    return (text, true);
                }
                match char::from_u32(unit as u32) {
                    Some(c) if unit >= 0x20 && (unit < 0x7f || unit >= 0xa0) => text.push(c),
                    _ => return (text, false),
                }
            }
        }
    }
    (text, false)
}

/// `str_` plus a sanitized, truncated rendition of the content.
fn string_label_name(text: &str) -> String {
    let mut name = String::from("str_");
    for c in text.chars().take(24) {
        name.push(if c.is_ascii_alphanumeric() { c } else { '_' });
    }
    name
}

#[cfg(test)]
mod tests;
