//! Property tests for the cross-reference maps.

use core_address::Address;
use core_document::{Access, Document, MemoryArea};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add { to: u64, from: u64 },
    RemoveFrom { from: u64 },
    RemoveAddress { addr: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // A small address pool makes collisions and re-pointing likely.
    let addr = 0u64..16;
    prop_oneof![
        (addr.clone(), 0u64..16).prop_map(|(to, from)| Op::Add { to, from }),
        addr.clone().prop_map(|from| Op::RemoveFrom { from }),
        addr.prop_map(|addr| Op::RemoveAddress { addr }),
    ]
}

proptest! {
    /// After any operation sequence, `to(from) = Some(to)` iff `from` is in
    /// `from(to)`, in both directions.
    #[test]
    fn maps_stay_mutually_consistent(ops in proptest::collection::vec(op_strategy(), 0..64)) {
        let doc = Document::new();
        doc.add_memory_area(MemoryArea::new(
            "pool",
            Address::flat(0),
            vec![0; 16],
            Access::READ,
            0,
            0,
            None,
        ))
        .unwrap();

        for op in ops {
            match op {
                Op::Add { to, from } => {
                    doc.add_cross_reference(Address::flat(to), Address::flat(from))
                }
                Op::RemoveFrom { from } => {
                    doc.remove_cross_reference(&Address::flat(from));
                }
                Op::RemoveAddress { addr } => {
                    // Deleting a cell clears both xref roles of its address.
                    let a = Address::flat(addr);
                    let _ = doc.set_cell(&a, core_document::Cell::value(1), true);
                    let _ = doc.delete_cell(&a);
                }
            }
        }

        for from in 0..16u64 {
            let from = Address::flat(from);
            if let Some(to) = doc.cross_reference_to(&from) {
                prop_assert!(doc.cross_references_from(&to).contains(&from));
            }
        }
        for to in 0..16u64 {
            let to = Address::flat(to);
            for from in doc.cross_references_from(&to) {
                prop_assert_eq!(doc.cross_reference_to(&from), Some(to));
            }
        }
    }

    /// Adding the same edge repeatedly is the same as adding it once.
    #[test]
    fn add_is_idempotent(to in 0u64..16, from in 0u64..16, repeats in 1usize..5) {
        let doc = Document::new();
        for _ in 0..repeats {
            doc.add_cross_reference(Address::flat(to), Address::flat(from));
        }
        prop_assert_eq!(
            doc.cross_references_from(&Address::flat(to)),
            vec![Address::flat(from)]
        );
        prop_assert_eq!(doc.cross_reference_to(&Address::flat(from)), Some(Address::flat(to)));
    }
}
