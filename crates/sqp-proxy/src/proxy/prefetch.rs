//! Prefetch table: speculative statement text -> replica running it

use std::collections::HashMap;

/// At most one entry per replica; rebuilt after every real query
#[derive(Debug, Default)]
pub struct PrefetchTable {
    entries: HashMap<String, usize>,
}

impl PrefetchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `query` as running on `replica`, replacing whatever that
    /// replica was previously recorded for
    pub fn insert(&mut self, query: &str, replica: usize) {
        self.remove_replica(replica);
        self.entries.insert(query.to_string(), replica);
    }

    pub fn get(&self, query: &str) -> Option<usize> {
        self.entries.get(query).copied()
    }

    pub fn remove_replica(&mut self, replica: usize) {
        self.entries.retain(|_, r| *r != replica);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
