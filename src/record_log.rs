//! Append-only, sequence-indexed store of accepted orders.
//!
//! The publisher is the only writer. Slots are immutable once pushed, so a
//! reader only needs the lock long enough to clone the `Arc` below the
//! current length.
use crate::record::{now_unix_ns, Order, Record};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RecordLog {
    entries: RwLock<Vec<Arc<Record>>>,
}

impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence (the current length) and append, as one
    /// critical section.
    pub fn append(&self, order: Order) -> Arc<Record> {
        let mut entries = self.entries.write();
        let record = Arc::new(Record {
            sequence: entries.len() as u64,
            published_unix_ns: now_unix_ns(),
            order,
        });
        entries.push(Arc::clone(&record));
        record
    }

    /// `None` for any sequence at or beyond the current length.
    pub fn get(&self, sequence: u64) -> Option<Arc<Record>> {
        let idx = usize::try_from(sequence).ok()?;
        self.entries.read().get(idx).cloned()
    }

    pub fn len(&self) -> u64 {
        self.entries.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
