//! Chord finger table

use crate::common::{RingId, RING_BITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Routing hint `i`: the first node known to follow `start = id + 2^i`.
pub struct FingerEntry {
    pub start: RingId,
    pub successor: RingId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// [RING_BITS] exponentially spaced routing hints.
///
/// Entry 0 is the node's successor, the owner keeps it in sync.
pub struct FingerTable {
    id: RingId,
    entries: Vec<FingerEntry>,
}

impl FingerTable {
    /// Create a table where every finger points back at `id`.
    pub fn new(id: RingId) -> Self {
        let entries = (0..RING_BITS)
            .map(|i| FingerEntry {
                start: id.finger_start(i),
                successor: id,
            })
            .collect();

        FingerTable { id, entries }
    }

    // === Getters ===

    /// Returns the [RingId] of the node owning this table.
    pub fn id(&self) -> &RingId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FingerEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[FingerEntry] {
        &self.entries
    }

    // === Public Methods ===

    /// Point finger `index` at `successor`, out of range indices are ignored.
    pub fn set(&mut self, index: usize, successor: RingId) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.successor = successor;
        }
    }

    /// Highest finger whose successor lies strictly between this node and `target`,
    /// or this node's own id if there is none.
    pub fn closest_preceding_finger(&self, target: RingId) -> RingId {
        self.entries
            .iter()
            .rev()
            .map(|entry| entry.successor)
            .find(|successor| successor.is_between(self.id, target))
            .unwrap_or(self.id)
    }

    /// Forget every finger pointing at `node`, they fall back to this node's id.
    pub fn remove(&mut self, node: RingId) {
        for entry in self.entries.iter_mut() {
            if entry.successor == node {
                entry.successor = self.id;
            }
        }
    }
}
