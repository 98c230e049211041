//! Cross-references between addresses.
//!
//! Two inverse maps: `from(to)` answers "who points at this target", `to(from)`
//! answers "what does this site reference". A site references at most one
//! target; a target may be referenced by many sites. The maps are kept
//! mutually consistent on every mutation.

use std::collections::{BTreeMap, BTreeSet};

use core_address::Address;

#[derive(Debug, Default)]
pub struct CrossReferences {
    from_map: BTreeMap<Address, BTreeSet<Address>>,
    to_map: BTreeMap<Address, Address>,
}

impl CrossReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `from` references `to`. Idempotent; re-pointing a site at
    /// a new target first severs the old edge.
    pub fn add(&mut self, to: Address, from: Address) {
        if let Some(previous) = self.to_map.get(&from).copied() {
            if previous == to {
                return;
            }
            self.sever(previous, from);
        }
        self.from_map.entry(to).or_default().insert(from);
        self.to_map.insert(from, to);
    }

    /// Drops the edge originating at `from`. Returns false when there is none.
    pub fn remove_from(&mut self, from: &Address) -> bool {
        match self.to_map.remove(from) {
            Some(to) => {
                self.sever(to, *from);
                true
            }
            None => false,
        }
    }

    /// Drops every edge touching `addr`, as origin or as target.
    pub fn remove_address(&mut self, addr: &Address) {
        self.remove_from(addr);
        if let Some(froms) = self.from_map.remove(addr) {
            for from in froms {
                self.to_map.remove(&from);
            }
        }
    }

    fn sever(&mut self, to: Address, from: Address) {
        if let Some(set) = self.from_map.get_mut(&to) {
            set.remove(&from);
            if set.is_empty() {
                self.from_map.remove(&to);
            }
        }
    }

    pub fn has_from(&self, to: &Address) -> bool {
        self.from_map.contains_key(to)
    }

    pub fn from(&self, to: &Address) -> Vec<Address> {
        self.from_map
            .get(to)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_to(&self, from: &Address) -> bool {
        self.to_map.contains_key(from)
    }

    pub fn to(&self, from: &Address) -> Option<Address> {
        self.to_map.get(from).copied()
    }

    pub fn clear(&mut self) {
        self.from_map.clear();
        self.to_map.clear();
    }

    /// Targets in address order, with their referencing sites.
    pub fn snapshot(&self) -> Vec<(Address, Vec<Address>)> {
        self.from_map
            .iter()
            .map(|(to, froms)| (*to, froms.iter().copied().collect()))
            .collect()
    }

    /// Checks `to_map[a] = b ⇔ a ∈ from_map[b]` in both directions.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.to_map.iter().all(|(from, to)| {
            self.from_map
                .get(to)
                .is_some_and(|set| set.contains(from))
        }) && self.from_map.iter().all(|(to, froms)| {
            !froms.is_empty()
                && froms
                    .iter()
                    .all(|from| self.to_map.get(from) == Some(to))
        })
    }
}
