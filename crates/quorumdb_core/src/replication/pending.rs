//! Records that are in the log but not yet applied to the store.

use crate::log::LogRecord;
use crate::types::CommitSeq;
use std::collections::BTreeMap;

/// Read-only view of appended-but-unapplied records.
///
/// Commit validation consults it so a key written by an in-doubt record
/// cannot be overwritten on the basis of a stale read.
#[derive(Debug, Clone, Copy)]
pub struct PendingRecords<'a> {
    records: &'a BTreeMap<CommitSeq, LogRecord>,
}

impl<'a> PendingRecords<'a> {
    pub(crate) fn new(records: &'a BTreeMap<CommitSeq, LogRecord>) -> Self {
        Self { records }
    }

    /// Returns true if any pending record writes `key` in `collection`.
    #[must_use]
    pub fn touches(&self, collection: &str, key: &[u8]) -> bool {
        self.records.values().any(|record| {
            record
                .writes
                .iter()
                .any(|w| w.collection == collection && w.key == key)
        })
    }

    /// Number of pending records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Lowest pending sequence.
    #[must_use]
    pub fn first_seq(&self) -> Option<CommitSeq> {
        self.records.keys().next().copied()
    }
}
