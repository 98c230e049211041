use super::*;
use crate::cell::{Cell, CellKind, Instruction, InstructionFlags};
use crate::event::{DocumentEvent, EventMask};
use crate::label::Label;
use crate::memory_area::{Access, MemoryArea};
use crate::multicell::MultiCellKind;

fn doc_with_area(start: u64, bytes: Vec<u8>) -> Document {
    let doc = Document::new();
    doc.add_memory_area(MemoryArea::new(
        ".text",
        Address::flat(start),
        bytes,
        Access::READ | Access::EXECUTE,
        1,
        0,
        Some(0),
    ))
    .unwrap();
    doc
}

#[test]
fn empty_document_over_one_area() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    assert_eq!(
        doc.cell(&Address::flat(0x1000)).unwrap().kind(),
        CellKind::Unknown
    );
    assert_eq!(doc.label_at(&Address::flat(0x1000)), None);
    assert_eq!(doc.first_address(), Some(Address::flat(0x1000)));
    assert_eq!(doc.last_address(), Some(Address::flat(0x100f)));
    assert_eq!(doc.address_count(), 16);
    assert_eq!(doc.cell(&Address::flat(0x2000)), None);
}

#[test]
fn overlapping_areas_are_rejected() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let overlapping = MemoryArea::new(
        ".data",
        Address::flat(0x100f),
        vec![0; 4],
        Access::READ,
        1,
        0,
        None,
    );
    assert!(matches!(
        doc.add_memory_area(overlapping),
        Err(Error::Overlap(_))
    ));
    let adjacent =
        MemoryArea::new(".data", Address::flat(0x1010), vec![0; 4], Access::READ, 1, 0, None);
    doc.add_memory_area(adjacent).unwrap();
}

#[test]
fn cell_replacement_conflicts_without_force() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let a = Address::flat(0x1000);
    doc.set_cell(&a, Cell::value(4), false).unwrap();

    // A two-byte value at 0x1002 lands inside the existing cell.
    let inside = Address::flat(0x1002);
    assert_eq!(
        doc.set_cell(&inside, Cell::value(2), false),
        Err(Error::Conflict(inside))
    );
    // Nothing changed.
    assert_eq!(doc.cell(&inside).unwrap().length(), 4);

    doc.set_cell(&inside, Cell::value(2), true).unwrap();
    assert_eq!(doc.cell(&a).unwrap().kind(), CellKind::Unknown);
    assert_eq!(doc.cell(&inside).unwrap().length(), 2);
}

#[test]
fn cell_must_stay_inside_its_area() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let tail = Address::flat(0x100f);
    assert_eq!(
        doc.set_cell(&tail, Cell::value(2), false),
        Err(Error::Overlap(tail))
    );
    assert_eq!(
        doc.set_cell(&Address::flat(0x2000), Cell::value(1), false),
        Err(Error::NotFound(Address::flat(0x2000)))
    );
}

#[test]
fn removing_a_cell_drops_its_cross_references() {
    let doc = doc_with_area(0x1000, vec![0; 0x2000]);
    let site = Address::flat(0x1000);
    let target = Address::flat(0x2000);

    let insn = Instruction::new("jmp", 1, 4).with_flow(InstructionFlags::JUMP);
    doc.set_cell(&site, Cell::instruction(insn), false).unwrap();
    doc.add_cross_reference(target, site);
    assert_eq!(doc.cross_references_from(&target), vec![site]);
    assert_eq!(doc.cross_reference_to(&site), Some(target));

    doc.delete_cell(&site).unwrap();
    assert!(doc.cross_references_from(&target).is_empty());
    assert_eq!(doc.cross_reference_to(&site), None);
}

#[test]
fn force_set_cell_over_referencing_site_drops_xrefs() {
    let doc = doc_with_area(0x1000, vec![0; 0x2000]);
    let site = Address::flat(0x1000);
    let target = Address::flat(0x2000);
    let insn = Instruction::new("jmp", 1, 4).with_flow(InstructionFlags::JUMP);
    doc.set_cell(&site, Cell::instruction(insn), false).unwrap();
    doc.add_cross_reference(target, site);

    doc.set_cell(&Address::flat(0x1002), Cell::value(4), true)
        .unwrap();
    assert!(doc.cross_references_from(&target).is_empty());
    assert_eq!(doc.cross_reference_to(&site), None);
}

#[test]
fn label_rename_emits_removal_then_insert() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let a = Address::flat(0x1000);
    let rx = doc.subscribe(EventMask::LABEL_UPDATED);

    doc.add_label(&a, Label::code("start"), false).unwrap();
    doc.add_label(&a, Label::code("_main"), true).unwrap();

    assert_eq!(doc.address_of_label("start"), None);
    assert_eq!(doc.address_of_label("_main"), Some(a));

    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events.len(), 3);
    assert!(matches!(
        &events[1],
        DocumentEvent::LabelUpdated { label, removed: true, .. } if label.name() == "start"
    ));
    assert!(matches!(
        &events[2],
        DocumentEvent::LabelUpdated { label, removed: false, .. } if label.name() == "_main"
    ));
}

#[test]
fn add_label_is_idempotent_under_force() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let a = Address::flat(0x1000);
    doc.add_label(&a, Label::code("start"), true).unwrap();
    let rx = doc.subscribe(EventMask::LABEL_UPDATED);
    doc.add_label(&a, Label::code("start"), true).unwrap();
    assert_eq!(rx.try_iter().count(), 0);
    assert_eq!(doc.label_count(), 1);
}

#[test]
fn string_detection_scenario() {
    let mut bytes = b"hi\0garbage".to_vec();
    bytes.resize(16, 0xff);
    let doc = doc_with_area(0x3000, bytes);
    let a = Address::flat(0x3000);

    doc.make_string(&a, StringEncoding::Ascii, 64).unwrap();

    for offset in 0..3u64 {
        let at = Address::flat(0x3000 + offset);
        assert_eq!(doc.cell(&at).unwrap().kind(), CellKind::Character);
    }
    let mc = doc.multi_cell(&a).unwrap();
    assert_eq!(mc.kind, MultiCellKind::String);
    assert_eq!(mc.size, 3);
    assert_eq!(doc.address_of_label("str_hi"), Some(a));

    // Second invocation is a no-op.
    let rx = doc.subscribe(EventMask::all());
    doc.make_string(&a, StringEncoding::Ascii, 64).unwrap();
    assert_eq!(rx.try_iter().count(), 0);
}

#[test]
fn string_detection_requires_terminator() {
    let doc = doc_with_area(0x3000, vec![b'a', b'b', 0x01, 0x02]);
    assert!(matches!(
        doc.make_string(&Address::flat(0x3000), StringEncoding::Ascii, 64),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn utf16_string_detection() {
    let mut bytes = Vec::new();
    for c in [b'o', b'k'] {
        bytes.extend_from_slice(&(c as u16).to_le_bytes());
    }
    bytes.extend_from_slice(&[0, 0]);
    bytes.resize(16, 0xee);
    let doc = doc_with_area(0x4000, bytes);
    let a = Address::flat(0x4000);

    doc.make_string(&a, StringEncoding::Utf16, 32).unwrap();
    let mc = doc.multi_cell(&a).unwrap();
    assert_eq!(mc.size, 6);
    assert_eq!(doc.cell(&a).unwrap().length(), 2);
    assert_eq!(doc.address_of_label("str_ok"), Some(a));
}

#[test]
fn address_walking_honors_cell_lengths() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let a = Address::flat(0x1000);
    doc.set_cell(&a, Cell::value(4), false).unwrap();

    assert_eq!(doc.next_address(&a), Some(Address::flat(0x1004)));
    assert_eq!(
        doc.next_address(&Address::flat(0x1004)),
        Some(Address::flat(0x1005))
    );
    assert_eq!(doc.previous_address(&Address::flat(0x1004)), Some(a));
    assert_eq!(
        doc.previous_address(&Address::flat(0x1006)),
        Some(Address::flat(0x1005))
    );
    // Mid-cell snaps to the covering start.
    assert_eq!(doc.nearest_address(&Address::flat(0x1002)), Some(a));
    assert_eq!(doc.move_address(&a, 2), Some(Address::flat(0x1005)));
    assert_eq!(doc.move_address(&Address::flat(0x1005), -2), Some(a));
}

#[test]
fn address_walking_crosses_area_boundaries() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    doc.add_memory_area(MemoryArea::new(
        ".data",
        Address::flat(0x2000),
        vec![0; 8],
        Access::READ,
        1,
        0,
        None,
    ))
    .unwrap();

    assert_eq!(
        doc.next_address(&Address::flat(0x100f)),
        Some(Address::flat(0x2000))
    );
    assert_eq!(
        doc.previous_address(&Address::flat(0x2000)),
        Some(Address::flat(0x100f))
    );
    // Unmapped gap snaps forward to the next area.
    assert_eq!(
        doc.nearest_address(&Address::flat(0x1800)),
        Some(Address::flat(0x2000))
    );
}

#[test]
fn position_round_trip() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    doc.set_cell(&Address::flat(0x1004), Cell::value(4), false)
        .unwrap();
    // 0x1000..0x1003 unknown (4), the value cell (1), 0x1008..0x100f unknown (8).
    assert_eq!(doc.address_count(), 13);

    for position in 0..doc.address_count() {
        let addr = doc.convert_position_to_address(position).unwrap();
        assert_eq!(
            doc.convert_address_to_position(&addr),
            Some(position),
            "position {position} did not round-trip via {addr}"
        );
    }
    // Mid-cell addresses have no position.
    assert_eq!(doc.convert_address_to_position(&Address::flat(0x1006)), None);
}

#[test]
fn file_offset_conversion() {
    let doc = Document::new();
    doc.add_memory_area(MemoryArea::new(
        ".text",
        Address::flat(0x1000),
        vec![0; 16],
        Access::READ,
        1,
        0,
        Some(0x400),
    ))
    .unwrap();
    assert_eq!(
        doc.convert_address_to_file_offset(&Address::flat(0x1004)),
        Ok(0x404)
    );
    doc.add_memory_area(MemoryArea::virtual_area(
        ".bss",
        Address::flat(0x2000),
        8,
        Access::READ | Access::WRITE,
        1,
        0,
    ))
    .unwrap();
    assert!(doc
        .convert_address_to_file_offset(&Address::flat(0x2000))
        .is_err());
}

#[test]
fn comments_round_trip() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let a = Address::flat(0x1004);
    assert_eq!(doc.comment(&a), None);
    doc.set_comment(&a, "entry stack setup");
    assert_eq!(doc.comment(&a).as_deref(), Some("entry stack setup"));
}

#[test]
fn for_each_label_allows_reentrant_mutation() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    doc.add_label(&Address::flat(0x1000), Label::code("a"), false)
        .unwrap();
    doc.add_label(&Address::flat(0x1001), Label::code("b"), false)
        .unwrap();

    let mut seen = Vec::new();
    doc.for_each_label(|addr, label| {
        seen.push(label.name().to_owned());
        // Mutating during the walk must neither deadlock nor disturb it.
        doc.add_label(addr, Label::code(format!("{}_renamed", label.name())), true)
            .unwrap();
    });
    assert_eq!(seen, vec!["a", "b"]);
    assert_eq!(doc.address_of_label("a_renamed"), Some(Address::flat(0x1000)));
    assert_eq!(doc.address_of_label("b"), None);
}

#[test]
fn change_value_size_respects_kinds() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    let a = Address::flat(0x1000);
    doc.set_cell(&a, Cell::value(2), false).unwrap();
    doc.change_value_size(&a, 64, false).unwrap();
    assert_eq!(doc.cell(&a).unwrap().length(), 8);
    assert!(doc.change_value_size(&a, 24, false).is_err());
    assert!(doc
        .change_value_size(&Address::flat(0x100c), 8, false)
        .is_err());
}

#[test]
fn remove_all_clears_and_announces() {
    let doc = doc_with_area(0x1000, vec![0; 16]);
    doc.add_label(&Address::flat(0x1000), Label::code("start"), false)
        .unwrap();
    let rx = doc.subscribe(EventMask::MEMORY_AREA_UPDATED);
    doc.remove_all();
    assert_eq!(doc.memory_area_count(), 0);
    assert_eq!(doc.label_count(), 0);
    assert_eq!(doc.first_address(), None);
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(
        &events[0],
        DocumentEvent::MemoryAreaUpdated { removed: true, .. }
    ));
}
