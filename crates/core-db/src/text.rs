//! Plain-text database back-end (`.mdt`).
//!
//! The file starts with the magic line `# Medusa Text Database`, followed by
//! `## MemoryArea`, `## Label`, `## CrossReference`, `## MultiCell`,
//! `## Cell` and `## Comment` sections. Cross-reference sites are prefixed
//! with U+2190; memory-area bytes are hex-encoded on the area line.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use core_address::Address;
use core_document::{
    Access, CellData, CellKind, CrossReferences, Label, LabelFlags, LabelStore, MemoryArea,
    MultiCell, MultiCellKind,
};
use tracing::{debug, warn};

use crate::{Database, Error, LabelEditor, Result};

const MAGIC: &str = "# Medusa Text Database";
const XREF_ARROW: char = '\u{2190}';

#[derive(Debug, Clone)]
enum LabelOp {
    Add(Address, Label),
    Remove(Address),
}

/// Side-table of label mutations recorded during a walk.
#[derive(Debug, Default)]
struct DelayedLabelOps {
    ops: Vec<LabelOp>,
}

impl LabelEditor for DelayedLabelOps {
    fn add_label(&mut self, addr: Address, label: Label) {
        self.ops.push(LabelOp::Add(addr, label));
    }

    fn remove_label(&mut self, addr: Address) {
        self.ops.push(LabelOp::Remove(addr));
    }
}

#[derive(Default)]
pub struct TextDatabase {
    path: Option<PathBuf>,
    areas: BTreeMap<Address, MemoryArea>,
    labels: LabelStore,
    xrefs: CrossReferences,
    cells: BTreeMap<Address, CellData>,
    multi_cells: BTreeMap<Address, MultiCell>,
    comments: BTreeMap<Address, String>,
}

impl TextDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(MAGIC);
        out.push('\n');

        out.push_str("## MemoryArea\n");
        for area in self.areas.values() {
            let name = area.name().replace(':', "_");
            let file_offset = area
                .file_offset()
                .map(|o| format!("{o:x}"))
                .unwrap_or_else(|| "-".to_owned());
            let bytes = if area.is_virtual() {
                "-".to_owned()
            } else {
                hex_encode(area.bytes())
            };
            out.push_str(&format!(
                "{name}:{}:{:x}:{}:{:x}:{}:{}:{file_offset}:{bytes}\n",
                area.start(),
                area.size(),
                area.access().letters(),
                area.architecture_tag(),
                area.default_mode(),
                if area.is_virtual() { "virtual" } else { "mapped" },
            ));
        }

        out.push_str("## Label\n");
        for (addr, label) in self.labels.snapshot() {
            if label.flags().is_empty() {
                out.push_str(&format!("{addr} {}\n", label.name()));
            } else {
                out.push_str(&format!(
                    "{addr} {} {:x}\n",
                    label.name(),
                    label.flags().bits()
                ));
            }
        }

        out.push_str("## CrossReference\n");
        for (to, froms) in self.xrefs.snapshot() {
            out.push_str(&to.to_string());
            for from in froms {
                out.push(' ');
                out.push(XREF_ARROW);
                out.push_str(&from.to_string());
            }
            out.push('\n');
        }

        out.push_str("## MultiCell\n");
        for (addr, mc) in &self.multi_cells {
            out.push_str(&format!("{addr}:{}:{:x}\n", mc.kind.name(), mc.size));
        }

        out.push_str("## Cell\n");
        for (addr, cell) in &self.cells {
            out.push_str(&format!(
                "{addr}:{}:{}:{:x}:{}:{:x}:{}\n",
                cell.kind.name(),
                cell.subtype,
                cell.length,
                cell.format_style,
                cell.architecture_tag,
                cell.mode,
            ));
        }

        out.push_str("## Comment\n");
        for (addr, text) in &self.comments {
            out.push_str(&format!("{addr} {}\n", escape_comment(text)));
        }
        out
    }

    fn parse(&mut self, content: &str) -> Result<()> {
        let mut lines = content.lines().enumerate();
        match lines.next() {
            Some((_, first)) if first == MAGIC => {}
            _ => {
                return Err(Error::Incompatible {
                    path: self.path.clone().unwrap_or_default(),
                })
            }
        }

        let mut section = String::new();
        for (number, line) in lines {
            let line_no = number + 1;
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix("## ") {
                section = header.to_owned();
                continue;
            }
            match section.as_str() {
                "MemoryArea" => self.parse_memory_area(line, line_no)?,
                "Label" => self.parse_label(line, line_no)?,
                "CrossReference" => self.parse_cross_reference(line, line_no)?,
                "MultiCell" => self.parse_multi_cell(line, line_no)?,
                "Cell" => self.parse_cell(line, line_no)?,
                "Comment" => self.parse_comment(line, line_no)?,
                other => {
                    warn!(target: "db", section = other, line = line_no, "unknown section, skipping");
                }
            }
        }
        Ok(())
    }

    fn parse_memory_area(&mut self, line: &str, line_no: usize) -> Result<()> {
        let fields: Vec<&str> = line.split(':').collect();
        // A segmented start address occupies two fields.
        if fields.len() < 9 {
            return Err(format_error(line_no, "memory area needs 9 fields"));
        }
        let (name, rest) = (fields[0], &fields[1..]);
        let (start, rest): (Address, &[&str]) = if rest.len() == 9 {
            let combined = format!("{}:{}", rest[0], rest[1]);
            (parse_address(&combined, line_no)?, &rest[2..])
        } else {
            (parse_address(rest[0], line_no)?, &rest[1..])
        };
        let size = parse_hex(rest[0], line_no)?;
        let access = Access::from_letters(rest[1])
            .ok_or_else(|| format_error(line_no, "bad access letters"))?;
        let tag = parse_hex(rest[2], line_no)? as u32;
        let mode = rest[3]
            .parse::<u8>()
            .map_err(|_| format_error(line_no, "bad mode"))?;
        let is_virtual = rest[4] == "virtual";
        let file_offset = match rest[5] {
            "-" => None,
            o => Some(parse_hex(o, line_no)?),
        };
        let area = if is_virtual {
            MemoryArea::virtual_area(name, start, size, access, tag, mode)
        } else {
            let bytes = hex_decode(rest[6]).ok_or_else(|| format_error(line_no, "bad bytes"))?;
            if bytes.len() as u64 != size {
                return Err(format_error(line_no, "byte count does not match size"));
            }
            MemoryArea::new(name, start, bytes, access, tag, mode, file_offset)
        };
        self.areas.insert(start, area);
        Ok(())
    }

    fn parse_label(&mut self, line: &str, line_no: usize) -> Result<()> {
        let mut parts = line.split_whitespace();
        let addr = parse_address(
            parts.next().ok_or_else(|| format_error(line_no, "missing address"))?,
            line_no,
        )?;
        let name = parts
            .next()
            .ok_or_else(|| format_error(line_no, "missing label name"))?;
        let flags = match parts.next() {
            Some(raw) => LabelFlags::from_bits_truncate(parse_hex(raw, line_no)? as u16),
            None => LabelFlags::empty(),
        };
        let _ = self.labels.insert(addr, Label::new(name, flags), true);
        Ok(())
    }

    fn parse_cross_reference(&mut self, line: &str, line_no: usize) -> Result<()> {
        let mut parts = line.split_whitespace();
        let to = parse_address(
            parts.next().ok_or_else(|| format_error(line_no, "missing target"))?,
            line_no,
        )?;
        for part in parts {
            let from = part
                .strip_prefix(XREF_ARROW)
                .ok_or_else(|| format_error(line_no, "site missing arrow"))?;
            self.xrefs.add(to, parse_address(from, line_no)?);
        }
        Ok(())
    }

    fn parse_multi_cell(&mut self, line: &str, line_no: usize) -> Result<()> {
        let fields: Vec<&str> = line.split(':').collect();
        let (addr, rest) = split_address_fields(&fields, 2, line_no)?;
        let kind = MultiCellKind::from_name(rest[0])
            .ok_or_else(|| format_error(line_no, "bad multicell kind"))?;
        let size = parse_hex(rest[1], line_no)?;
        self.multi_cells.insert(addr, MultiCell::new(kind, size));
        Ok(())
    }

    fn parse_cell(&mut self, line: &str, line_no: usize) -> Result<()> {
        let fields: Vec<&str> = line.split(':').collect();
        let (addr, rest) = split_address_fields(&fields, 6, line_no)?;
        let kind = CellKind::from_name(rest[0])
            .ok_or_else(|| format_error(line_no, "bad cell kind"))?;
        let subtype = rest[1]
            .parse::<u8>()
            .map_err(|_| format_error(line_no, "bad subtype"))?;
        let length = parse_hex(rest[2], line_no)? as u16;
        let format_style = rest[3]
            .parse::<u8>()
            .map_err(|_| format_error(line_no, "bad format style"))?;
        let tag = parse_hex(rest[4], line_no)? as u32;
        let mode = rest[5]
            .parse::<u8>()
            .map_err(|_| format_error(line_no, "bad mode"))?;
        let mut data = CellData::new(kind, subtype, length).with_architecture(tag, mode);
        data.format_style = format_style;
        self.cells.insert(addr, data);
        Ok(())
    }

    fn parse_comment(&mut self, line: &str, line_no: usize) -> Result<()> {
        let (addr, text) = line
            .split_once(' ')
            .ok_or_else(|| format_error(line_no, "missing comment text"))?;
        self.comments
            .insert(parse_address(addr, line_no)?, unescape_comment(text));
        Ok(())
    }
}

impl Database for TextDatabase {
    fn name(&self) -> &str {
        "Text"
    }

    fn extension(&self) -> &str {
        ".mdt"
    }

    fn is_compatible(&self, path: &Path) -> bool {
        fs::read_to_string(path)
            .map(|content| content.lines().next() == Some(MAGIC))
            .unwrap_or(false)
    }

    fn open(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        self.path = Some(path.to_owned());
        self.parse(&content)?;
        debug!(target: "db", path = %path.display(), areas = self.areas.len(), "database opened");
        Ok(())
    }

    fn create(&mut self, path: &Path) -> Result<()> {
        if self.path.is_some() {
            return Err(Error::AlreadyExists {
                path: self.path.clone().unwrap_or_default(),
            });
        }
        if path.exists() {
            return Err(Error::AlreadyExists {
                path: path.to_owned(),
            });
        }
        fs::write(path, format!("{MAGIC}\n"))?;
        self.path = Some(path.to_owned());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let path = self.path.clone().ok_or(Error::NotOpen)?;
        fs::write(&path, self.render())?;
        debug!(target: "db", path = %path.display(), "database flushed");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.path = None;
        Ok(())
    }

    fn add_memory_area(&mut self, area: MemoryArea) -> bool {
        self.areas.insert(area.start(), area).is_none()
    }

    fn memory_area(&self, addr: &Address) -> Option<MemoryArea> {
        let (_, area) = self.areas.range(..=*addr).next_back()?;
        area.contains(addr).then(|| area.clone())
    }

    fn for_each_memory_area(&self, f: &mut dyn FnMut(&MemoryArea)) {
        for area in self.areas.values() {
            f(area);
        }
    }

    fn add_label(&mut self, addr: Address, label: Label) -> bool {
        self.labels.insert(addr, label, false).is_ok()
    }

    fn remove_label(&mut self, addr: &Address) -> bool {
        self.labels.remove(addr).is_some()
    }

    fn has_label(&self, addr: &Address) -> bool {
        self.labels.get(addr).is_some()
    }

    fn label(&self, addr: &Address) -> Option<Label> {
        self.labels.get(addr).cloned()
    }

    fn label_address(&self, name: &str) -> Option<Address> {
        self.labels.address_of(name)
    }

    fn for_each_label(&mut self, f: &mut dyn FnMut(&mut dyn LabelEditor, &Address, &Label)) {
        let mut delayed = DelayedLabelOps::default();
        for (addr, label) in self.labels.snapshot() {
            f(&mut delayed, &addr, &label);
        }
        for op in delayed.ops {
            match op {
                LabelOp::Add(addr, label) => {
                    let _ = self.labels.insert(addr, label, true);
                }
                LabelOp::Remove(addr) => {
                    self.labels.remove(&addr);
                }
            }
        }
    }

    fn add_cross_reference(&mut self, to: Address, from: Address) -> bool {
        self.xrefs.add(to, from);
        true
    }

    fn remove_cross_reference(&mut self, from: &Address) -> bool {
        self.xrefs.remove_from(from)
    }

    fn remove_cross_references(&mut self) -> bool {
        self.xrefs.clear();
        true
    }

    fn has_cross_reference_from(&self, to: &Address) -> bool {
        self.xrefs.has_from(to)
    }

    fn cross_references_from(&self, to: &Address) -> Vec<Address> {
        self.xrefs.from(to)
    }

    fn has_cross_reference_to(&self, from: &Address) -> bool {
        self.xrefs.has_to(from)
    }

    fn cross_reference_to(&self, from: &Address) -> Option<Address> {
        self.xrefs.to(from)
    }

    fn for_each_cross_reference(&self, f: &mut dyn FnMut(&Address, &[Address])) {
        for (to, froms) in self.xrefs.snapshot() {
            f(&to, &froms);
        }
    }

    fn cell_data(&self, addr: &Address) -> Option<CellData> {
        self.cells.get(addr).cloned()
    }

    fn set_cell_data(&mut self, addr: Address, data: CellData) -> bool {
        self.cells.insert(addr, data);
        true
    }

    fn for_each_cell(&self, f: &mut dyn FnMut(&Address, &CellData)) {
        for (addr, data) in &self.cells {
            f(addr, data);
        }
    }

    fn add_multi_cell(&mut self, addr: Address, multi_cell: MultiCell) -> bool {
        self.multi_cells.insert(addr, multi_cell).is_none()
    }

    fn remove_multi_cell(&mut self, addr: &Address) -> bool {
        self.multi_cells.remove(addr).is_some()
    }

    fn multi_cell(&self, addr: &Address) -> Option<MultiCell> {
        self.multi_cells.get(addr).cloned()
    }

    fn for_each_multi_cell(&self, f: &mut dyn FnMut(&Address, &MultiCell)) {
        for (addr, mc) in &self.multi_cells {
            f(addr, mc);
        }
    }

    fn set_comment(&mut self, addr: Address, text: String) -> bool {
        self.comments.insert(addr, text);
        true
    }

    fn comment(&self, addr: &Address) -> Option<String> {
        self.comments.get(addr).cloned()
    }

    fn for_each_comment(&self, f: &mut dyn FnMut(&Address, &str)) {
        for (addr, text) in &self.comments {
            f(addr, text);
        }
    }
}

fn format_error(line: usize, reason: &str) -> Error {
    Error::Format {
        line,
        reason: reason.to_owned(),
    }
}

fn parse_address(raw: &str, line_no: usize) -> Result<Address> {
    raw.parse()
        .map_err(|_| format_error(line_no, "bad address"))
}

fn parse_hex(raw: &str, line_no: usize) -> Result<u64> {
    u64::from_str_radix(raw.strip_prefix("0x").unwrap_or(raw), 16)
        .map_err(|_| format_error(line_no, "bad hex value"))
}

/// Splits colon-separated fields whose leading address may itself contain a
/// colon (segmented form), leaving exactly `tail` fields after it.
fn split_address_fields<'a>(
    fields: &[&'a str],
    tail: usize,
    line_no: usize,
) -> Result<(Address, Vec<&'a str>)> {
    if fields.len() == tail + 1 {
        Ok((parse_address(fields[0], line_no)?, fields[1..].to_vec()))
    } else if fields.len() == tail + 2 {
        let combined = format!("{}:{}", fields[0], fields[1]);
        Ok((parse_address(&combined, line_no)?, fields[2..].to_vec()))
    } else {
        Err(format_error(line_no, "wrong field count"))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

fn escape_comment(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape_comment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{load_document, save_document};
    use core_document::{Cell, Document, StringEncoding};

    fn sample_document() -> Document {
        let doc = Document::new();
        doc.add_memory_area(MemoryArea::new(
            ".text",
            Address::flat(0x1000),
            b"hi\0padding-bytes".to_vec(),
            Access::READ | Access::EXECUTE,
            0x1234,
            0,
            Some(0x200),
        ))
        .unwrap();
        doc.add_memory_area(MemoryArea::virtual_area(
            ".bss",
            Address::flat(0x8000),
            0x40,
            Access::READ | Access::WRITE,
            0x1234,
            0,
        ))
        .unwrap();
        doc.make_string(&Address::flat(0x1000), StringEncoding::Ascii, 16)
            .unwrap();
        doc.set_cell(&Address::flat(0x1008), Cell::value(4), true)
            .unwrap();
        doc.add_label(&Address::flat(0x1008), Label::data("answer"), false)
            .unwrap();
        doc.add_cross_reference(Address::flat(0x1008), Address::flat(0x1004));
        doc.add_cross_reference(Address::flat(0x1008), Address::flat(0x100c));
        doc.set_comment(&Address::flat(0x1008), "two\nlines");
        doc
    }

    #[test]
    fn round_trip_preserves_everything() {
        let doc = sample_document();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.mdt");

        let mut db = TextDatabase::new();
        db.create(&path).unwrap();
        save_document(&mut db, &doc).unwrap();
        db.close().unwrap();

        let mut reopened = TextDatabase::new();
        assert!(reopened.is_compatible(&path));
        reopened.open(&path).unwrap();
        let restored = Document::new();
        load_document(&mut reopened, &restored).unwrap();

        // Areas, bytes included.
        assert_eq!(restored.memory_area_count(), 2);
        assert_eq!(
            restored.read_memory(&Address::flat(0x1000), 3).unwrap(),
            b"hi\0".to_vec()
        );
        // Labels both ways.
        assert_eq!(restored.address_of_label("str_hi"), Some(Address::flat(0x1000)));
        assert_eq!(
            restored.label_at(&Address::flat(0x1008)).unwrap(),
            Label::data("answer")
        );
        // Cells with their descriptors.
        let mut cells = Vec::new();
        restored.for_each_cell(|a, d| cells.push((*a, d.clone())));
        let mut original_cells = Vec::new();
        doc.for_each_cell(|a, d| original_cells.push((*a, d.clone())));
        assert_eq!(cells, original_cells);
        // Multi-cells, xrefs, comments.
        assert_eq!(
            restored.multi_cell(&Address::flat(0x1000)),
            doc.multi_cell(&Address::flat(0x1000))
        );
        assert_eq!(
            restored.cross_references_from(&Address::flat(0x1008)),
            vec![Address::flat(0x1004), Address::flat(0x100c)]
        );
        assert_eq!(
            restored.comment(&Address::flat(0x1008)).as_deref(),
            Some("two\nlines")
        );
    }

    #[test]
    fn create_refuses_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists.mdt");
        fs::write(&path, "something").unwrap();
        let mut db = TextDatabase::new();
        assert!(matches!(
            db.create(&path),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn incompatible_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.txt");
        fs::write(&path, "# Some Other Format\n").unwrap();
        let db = TextDatabase::new();
        assert!(!db.is_compatible(&path));
        let mut db = TextDatabase::new();
        assert!(matches!(
            db.open(&path),
            Err(Error::Incompatible { .. })
        ));
    }

    #[test]
    fn for_each_label_buffers_mutations() {
        let mut db = TextDatabase::new();
        db.add_label(Address::flat(0x1000), Label::code("a"));
        db.add_label(Address::flat(0x2000), Label::code("b"));

        let mut walked = Vec::new();
        db.for_each_label(&mut |editor, addr, label| {
            walked.push(label.name().to_owned());
            // Mutations recorded mid-walk apply only afterwards.
            editor.remove_label(*addr);
            editor.add_label(addr.move_by(4), Label::code(format!("{}2", label.name())));
        });
        assert_eq!(walked, vec!["a", "b"]);
        assert!(!db.has_label(&Address::flat(0x1000)));
        assert_eq!(db.label_address("a2"), Some(Address::flat(0x1004)));
        assert_eq!(db.label_address("b2"), Some(Address::flat(0x2004)));
    }

    #[test]
    fn xref_arrow_format() {
        let mut db = TextDatabase::new();
        db.add_cross_reference(Address::flat(0x2000), Address::flat(0x1000));
        db.add_cross_reference(Address::flat(0x2000), Address::flat(0x1008));
        let rendered = db.render();
        assert!(rendered.contains("00002000 \u{2190}00001000 \u{2190}00001008"));
    }

    #[test]
    fn magic_line_is_exact() {
        let db = TextDatabase::new();
        assert!(db.render().starts_with("# Medusa Text Database\n"));
    }
}
