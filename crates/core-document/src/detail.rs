//! Auxiliary metadata keyed by content-addressed ids.

use std::collections::HashMap;
use std::fmt;

use core_address::Address;
use sha2::{Digest, Sha256};

/// 160-bit content-addressed identifier for detail records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; 20]);

impl Id {
    /// Derives an id from arbitrary content (SHA-256 truncated to 160 bits).
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        Id(bytes)
    }

    pub fn from_name(name: &str) -> Self {
        Self::from_content(name.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Edges of a control-flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Unconditional,
    Taken,
    NotTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    /// First instruction address.
    pub first: Address,
    /// Last instruction address (inclusive).
    pub last: Address,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlFlowGraph {
    blocks: Vec<BasicBlock>,
    edges: Vec<(usize, usize, EdgeKind)>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block, returning its index; a block with the same first address
    /// is reused.
    pub fn add_block(&mut self, block: BasicBlock) -> usize {
        if let Some(idx) = self.block_index(&block.first) {
            self.blocks[idx] = block;
            return idx;
        }
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn add_edge(&mut self, from: usize, to: usize, kind: EdgeKind) {
        if !self.edges.contains(&(from, to, kind)) {
            self.edges.push((from, to, kind));
        }
    }

    pub fn block_index(&self, first: &Address) -> Option<usize> {
        self.blocks.iter().position(|b| b.first == *first)
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn edges(&self) -> &[(usize, usize, EdgeKind)] {
        &self.edges
    }

    /// Smallest and largest covered addresses, when the graph has any block.
    pub fn extent(&self) -> Option<(Address, Address)> {
        let first = self.blocks.iter().map(|b| b.first).min()?;
        let last = self.blocks.iter().map(|b| b.last).max()?;
        Some((first, last))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub type_name: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDetail {
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<Parameter>,
    pub control_flow_graph: ControlFlowGraph,
    pub stack_frame_size: u32,
}

impl FunctionDetail {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            return_type: String::new(),
            parameters: Vec::new(),
            control_flow_graph: ControlFlowGraph::new(),
            stack_frame_size: 0,
        }
    }

    pub fn id(&self) -> Id {
        Id::from_name(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueDetail {
    pub name: String,
    pub value_type: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureDetail {
    pub name: String,
    /// Field name and width in bits, in declaration order.
    pub fields: Vec<(String, u16)>,
}

/// All detail records of a document plus the per-address bindings.
#[derive(Debug, Default)]
pub struct DetailStore {
    functions: HashMap<Id, FunctionDetail>,
    values: HashMap<Id, ValueDetail>,
    structures: HashMap<Id, StructureDetail>,
    bindings: HashMap<(Address, u8), Id>,
}

impl DetailStore {
    pub fn function(&self, id: &Id) -> Option<&FunctionDetail> {
        self.functions.get(id)
    }

    pub fn set_function(&mut self, id: Id, detail: FunctionDetail) {
        self.functions.insert(id, detail);
    }

    pub fn value(&self, id: &Id) -> Option<&ValueDetail> {
        self.values.get(id)
    }

    pub fn set_value(&mut self, id: Id, detail: ValueDetail) {
        self.values.insert(id, detail);
    }

    pub fn structure(&self, id: &Id) -> Option<&StructureDetail> {
        self.structures.get(id)
    }

    pub fn set_structure(&mut self, id: Id, detail: StructureDetail) {
        self.structures.insert(id, detail);
    }

    pub fn binding(&self, addr: &Address, index: u8) -> Option<Id> {
        self.bindings.get(&(*addr, index)).copied()
    }

    pub fn bind(&mut self, addr: Address, index: u8, id: Id) {
        self.bindings.insert((addr, index), id);
    }

    pub fn unbind(&mut self, addr: &Address, index: u8) -> bool {
        self.bindings.remove(&(*addr, index)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic_and_content_addressed() {
        let a = Id::from_name("fcn_1000");
        let b = Id::from_name("fcn_1000");
        let c = Id::from_name("fcn_2000");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 40);
    }

    #[test]
    fn cfg_dedups_blocks_and_edges() {
        let mut cfg = ControlFlowGraph::new();
        let b0 = cfg.add_block(BasicBlock {
            first: Address::flat(0x1000),
            last: Address::flat(0x1008),
        });
        let b1 = cfg.add_block(BasicBlock {
            first: Address::flat(0x1010),
            last: Address::flat(0x1014),
        });
        let again = cfg.add_block(BasicBlock {
            first: Address::flat(0x1000),
            last: Address::flat(0x100c),
        });
        assert_eq!(b0, again);
        cfg.add_edge(b0, b1, EdgeKind::Unconditional);
        cfg.add_edge(b0, b1, EdgeKind::Unconditional);
        assert_eq!(cfg.blocks().len(), 2);
        assert_eq!(cfg.edges().len(), 1);
        assert_eq!(
            cfg.extent(),
            Some((Address::flat(0x1000), Address::flat(0x1014)))
        );
    }

    #[test]
    fn bindings_attach_details_to_addresses() {
        let mut store = DetailStore::default();
        let detail = FunctionDetail::new("fcn_1000");
        let id = detail.id();
        store.set_function(id, detail);
        store.bind(Address::flat(0x1000), 0, id);
        assert_eq!(store.binding(&Address::flat(0x1000), 0), Some(id));
        assert!(store.unbind(&Address::flat(0x1000), 0));
        assert!(!store.unbind(&Address::flat(0x1000), 0));
    }
}
