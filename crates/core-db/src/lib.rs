//! Persistence back-ends for documents.
//!
//! A [`Database`] stores the address-keyed facts of a document — memory
//! areas, labels, cross-references, cells, multi-cells, comments — behind a
//! format-agnostic trait. [`text::TextDatabase`] is the plain-text reference
//! back-end. [`save_document`] / [`load_document`] move whole documents in
//! and out of a back-end.

use std::path::{Path, PathBuf};

use core_address::Address;
use core_document::{CellData, Document, Label, MemoryArea, MultiCell};
use thiserror::Error;

pub mod text;

pub use text::TextDatabase;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{path}: not a compatible database")]
    Incompatible { path: PathBuf },
    #[error("{path}: already exists")]
    AlreadyExists { path: PathBuf },
    #[error("no backing file opened")]
    NotOpen,
    #[error("malformed database line {line}: {reason}")]
    Format { line: usize, reason: String },
    #[error(transparent)]
    Document(#[from] core_document::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Buffered label mutations handed to [`Database::for_each_label`]
/// callbacks. Whatever the callback records is applied once the walk is
/// over, which makes the iteration re-entrant by construction.
pub trait LabelEditor {
    fn add_label(&mut self, addr: Address, label: Label);
    fn remove_label(&mut self, addr: Address);
}

pub trait Database: Send {
    fn name(&self) -> &str;

    /// File extension including the dot.
    fn extension(&self) -> &str;

    fn is_compatible(&self, path: &Path) -> bool;

    fn open(&mut self, path: &Path) -> Result<()>;

    /// Creates a fresh database file; refuses to clobber an existing one.
    fn create(&mut self, path: &Path) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    // Memory areas
    fn add_memory_area(&mut self, area: MemoryArea) -> bool;
    fn memory_area(&self, addr: &Address) -> Option<MemoryArea>;
    fn for_each_memory_area(&self, f: &mut dyn FnMut(&MemoryArea));

    // Labels
    fn add_label(&mut self, addr: Address, label: Label) -> bool;
    fn remove_label(&mut self, addr: &Address) -> bool;
    fn has_label(&self, addr: &Address) -> bool;
    fn label(&self, addr: &Address) -> Option<Label>;
    fn label_address(&self, name: &str) -> Option<Address>;

    /// Walks every label. The callback may record label additions and
    /// removals through the [`LabelEditor`]; they take effect after the walk.
    fn for_each_label(&mut self, f: &mut dyn FnMut(&mut dyn LabelEditor, &Address, &Label));

    // Cross-references
    fn add_cross_reference(&mut self, to: Address, from: Address) -> bool;
    fn remove_cross_reference(&mut self, from: &Address) -> bool;
    fn remove_cross_references(&mut self) -> bool;
    fn has_cross_reference_from(&self, to: &Address) -> bool;
    fn cross_references_from(&self, to: &Address) -> Vec<Address>;
    fn has_cross_reference_to(&self, from: &Address) -> bool;
    fn cross_reference_to(&self, from: &Address) -> Option<Address>;
    fn for_each_cross_reference(&self, f: &mut dyn FnMut(&Address, &[Address]));

    // Cells
    fn cell_data(&self, addr: &Address) -> Option<CellData>;
    fn set_cell_data(&mut self, addr: Address, data: CellData) -> bool;
    fn for_each_cell(&self, f: &mut dyn FnMut(&Address, &CellData));

    // Multi-cells
    fn add_multi_cell(&mut self, addr: Address, multi_cell: MultiCell) -> bool;
    fn remove_multi_cell(&mut self, addr: &Address) -> bool;
    fn multi_cell(&self, addr: &Address) -> Option<MultiCell>;
    fn for_each_multi_cell(&self, f: &mut dyn FnMut(&Address, &MultiCell));

    // Comments
    fn set_comment(&mut self, addr: Address, text: String) -> bool;
    fn comment(&self, addr: &Address) -> Option<String>;
    fn for_each_comment(&self, f: &mut dyn FnMut(&Address, &str));
}

/// Copies every persistable fact of `document` into `database` and flushes.
pub fn save_document(database: &mut dyn Database, document: &Document) -> Result<()> {
    document.for_each_memory_area(|area| {
        database.add_memory_area(area.clone());
    });
    document.for_each_label(|addr, label| {
        database.add_label(*addr, label.clone());
    });
    document.for_each_cross_reference(|to, froms| {
        for from in froms {
            database.add_cross_reference(*to, *from);
        }
    });
    document.for_each_cell(|addr, data| {
        database.set_cell_data(*addr, data.clone());
    });
    document.for_each_multi_cell(|addr, multi_cell| {
        database.add_multi_cell(*addr, multi_cell.clone());
    });
    document.for_each_comment(|addr, text| {
        database.set_comment(*addr, text.to_owned());
    });
    database.flush()
}

/// Restores a database's content into an empty document.
pub fn load_document(database: &mut dyn Database, document: &Document) -> Result<()> {
    let mut areas = Vec::new();
    database.for_each_memory_area(&mut |area| areas.push(area.clone()));
    for area in areas {
        document.add_memory_area(area)?;
    }

    let mut labels = Vec::new();
    database.for_each_label(&mut |_, addr, label| labels.push((*addr, label.clone())));
    for (addr, label) in labels {
        document.add_label(&addr, label, true)?;
    }

    let mut cells = Vec::new();
    database.for_each_cell(&mut |addr, data| cells.push((*addr, data.clone())));
    for (addr, data) in cells {
        document.set_cell(&addr, core_document::Cell::Plain(data), true)?;
    }

    let mut multi_cells = Vec::new();
    database.for_each_multi_cell(&mut |addr, mc| multi_cells.push((*addr, mc.clone())));
    for (addr, mc) in multi_cells {
        document.set_multi_cell(&addr, mc, true)?;
    }

    let mut xrefs = Vec::new();
    database.for_each_cross_reference(&mut |to, froms| {
        for from in froms {
            xrefs.push((*to, *from));
        }
    });
    for (to, from) in xrefs {
        document.add_cross_reference(to, from);
    }

    let mut comments = Vec::new();
    database.for_each_comment(&mut |addr, text| comments.push((*addr, text.to_owned())));
    for (addr, text) in comments {
        document.set_comment(&addr, text);
    }
    Ok(())
}
