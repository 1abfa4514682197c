//! Savepoint ledger
//!
//! Per replica: whether the speculation savepoint still marks the current
//! state and whether a speculative write there is still unconfirmed. An
//! unconfirmed write must be undone before the next real write reaches that
//! replica.

/// How to reverse one speculative write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    /// The speculative statement itself
    pub statement: String,
    /// Compensating statement; empty means "roll back to the savepoint"
    pub undo: String,
    /// INSERT ... ON DUPLICATE KEY UPDATE; its undo only holds when the row
    /// already existed
    pub upsert: bool,
}

#[derive(Debug, Default, Clone)]
struct ReplicaEntry {
    have_savepoint: bool,
    pending: Option<UndoRecord>,
}

#[derive(Debug, Clone)]
pub struct SavepointLedger {
    replicas: Vec<ReplicaEntry>,
}

impl SavepointLedger {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: vec![ReplicaEntry::default(); replicas],
        }
    }

    /// Transaction boundary: savepoints are gone, nothing is pending
    pub fn reset(&mut self) {
        self.replicas.iter_mut().for_each(|r| *r = ReplicaEntry::default());
    }

    pub fn have_savepoint(&self, replica: usize) -> bool {
        self.replicas.get(replica).is_some_and(|r| r.have_savepoint)
    }

    pub fn set_savepoint(&mut self, replica: usize) {
        if let Some(r) = self.replicas.get_mut(replica) {
            r.have_savepoint = true;
        }
    }

    /// A confirmed write moved every replica past its savepoint
    pub fn invalidate_savepoints(&mut self) {
        self.replicas.iter_mut().for_each(|r| r.have_savepoint = false);
    }

    pub fn need_rollback(&self, replica: usize) -> bool {
        self.replicas.get(replica).is_some_and(|r| r.pending.is_some())
    }

    pub fn pending(&self, replica: usize) -> Option<&UndoRecord> {
        self.replicas.get(replica).and_then(|r| r.pending.as_ref())
    }

    pub fn mark_pending(&mut self, replica: usize, record: UndoRecord) {
        if let Some(r) = self.replicas.get_mut(replica) {
            r.pending = Some(record);
        }
    }

    /// Clear the obligation (confirmed or rolled back); returns the record
    pub fn resolve(&mut self, replica: usize) -> Option<UndoRecord> {
        self.replicas.get_mut(replica).and_then(|r| r.pending.take())
    }

    /// Replicas with an unconfirmed speculative write
    pub fn pending_replicas(&self) -> Vec<usize> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.pending.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}
