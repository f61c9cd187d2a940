//! Sequence-ordered reassembly of out-of-order results

use std::collections::BTreeMap;

/// Holds results until every lower sequence number has been released
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    held: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new(first: u64) -> Self {
        Self {
            next: first,
            held: BTreeMap::new(),
        }
    }

    /// Hold a result; returns false for a sequence number already released or held
    pub fn insert(&mut self, seq: u64, item: T) -> bool {
        if seq < self.next || self.held.contains_key(&seq) {
            return false;
        }
        self.held.insert(seq, item);
        true
    }

    /// Release the next result if it has arrived
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.held.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// Peek at the next releasable result
    pub fn peek_ready(&self) -> Option<&T> {
        self.held.get(&self.next)
    }

    /// Sequence number expected next
    pub fn next_seq(&self) -> u64 {
        self.next
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
