//! Labels: unique names bound bijectively to addresses.

use std::collections::HashMap;
use std::fmt;

use core_address::Address;

use crate::{Error, Result};

bitflags::bitflags! {
    /// Classification of a label; the cell-mask bits mirror what the labeled
    /// address holds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LabelFlags: u16 {
        const CODE     = 1 << 0;
        const DATA     = 1 << 1;
        const FUNCTION = 1 << 2;
        const STRING   = 1 << 3;
        const IMPORTED = 1 << 4;
        const EXPORTED = 1 << 5;
        const GLOBAL   = 1 << 6;
        const LOCAL    = 1 << 7;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    name: String,
    flags: LabelFlags,
}

impl Label {
    pub fn new(name: impl Into<String>, flags: LabelFlags) -> Self {
        Self {
            name: name.into(),
            flags,
        }
    }

    pub fn code(name: impl Into<String>) -> Self {
        Self::new(name, LabelFlags::CODE)
    }

    pub fn data(name: impl Into<String>) -> Self {
        Self::new(name, LabelFlags::DATA)
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self::new(name, LabelFlags::CODE | LabelFlags::FUNCTION)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, LabelFlags::DATA | LabelFlags::STRING)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> LabelFlags {
        self.flags
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Two mutually consistent maps behind one API; every mutation keeps the
/// address↔name relation bijective.
#[derive(Debug, Default)]
pub struct LabelStore {
    by_address: HashMap<Address, Label>,
    by_name: HashMap<String, Address>,
}

impl LabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &Address) -> Option<&Label> {
        self.by_address.get(addr)
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Inserts the binding, returning the bindings evicted to keep the
    /// relation bijective. Without `force` any collision is a
    /// [`Error::Conflict`]; re-inserting an identical binding is a no-op
    /// either way.
    pub fn insert(
        &mut self,
        addr: Address,
        label: Label,
        force: bool,
    ) -> Result<Vec<(Address, Label)>> {
        if self.by_address.get(&addr) == Some(&label) {
            return Ok(Vec::new());
        }

        let addr_collision = self.by_address.contains_key(&addr);
        let name_collision = self.by_name.contains_key(label.name());
        if (addr_collision || name_collision) && !force {
            return Err(Error::Conflict(addr));
        }

        let mut evicted = Vec::new();
        if let Some(old) = self.remove(&addr) {
            evicted.push((addr, old));
        }
        if let Some(other_addr) = self.by_name.get(label.name()).copied() {
            if let Some(old) = self.remove(&other_addr) {
                evicted.push((other_addr, old));
            }
        }
        self.by_name.insert(label.name().to_owned(), addr);
        self.by_address.insert(addr, label);
        Ok(evicted)
    }

    pub fn remove(&mut self, addr: &Address) -> Option<Label> {
        let label = self.by_address.remove(addr)?;
        self.by_name.remove(label.name());
        Some(label)
    }

    /// Consistent snapshot sorted by address, used for re-entrant walks and
    /// persistence.
    pub fn snapshot(&self) -> Vec<(Address, Label)> {
        let mut entries: Vec<_> = self
            .by_address
            .iter()
            .map(|(a, l)| (*a, l.clone()))
            .collect();
        entries.sort_by_key(|(a, _)| *a);
        entries
    }
}
