//! In-memory collection store, derived from the log.
//!
//! The store is a rebuildable cache: every entry is the fold of committed log
//! records in sequence order. Readers take short per-collection read locks and
//! copy `(value, version)` out. The only writer is
//! [`CollectionStore::apply_committed`].

mod collection;

pub use collection::{CollectionHandle, Observation, VersionedValue};

use crate::error::{CoreError, CoreResult};
use crate::log::{Log, LogRecord};
use crate::types::{CommitSeq, Version};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One row of a store snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotRow {
    /// Collection name.
    pub collection: String,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes; `None` for a removed key.
    pub value: Option<Vec<u8>>,
    /// Version of the last write.
    pub version: Version,
}

/// Registry of named collections plus the applied-sequence watermark.
#[derive(Debug, Default)]
pub struct CollectionStore {
    collections: RwLock<HashMap<String, CollectionHandle>>,
    /// Per-name creation locks.
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes `apply_committed` and holds the last applied sequence.
    applied: Mutex<CommitSeq>,
}

impl CollectionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collection called `name`, creating it empty if needed.
    ///
    /// Concurrent calls with the same name materialize exactly one collection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty name.
    pub fn get_or_create(&self, name: &str) -> CoreResult<CollectionHandle> {
        if name.is_empty() {
            return Err(CoreError::invalid_argument("collection name must not be empty"));
        }
        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }

        let name_lock = Arc::clone(
            self.name_locks
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _creating = name_lock.lock();

        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }
        let handle = CollectionHandle::new(name);
        self.collections
            .write()
            .insert(name.to_string(), handle.clone());
        debug!(collection = name, "collection created");
        Ok(handle)
    }

    /// Returns the collection called `name` if it exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<CollectionHandle> {
        self.collections.read().get(name).cloned()
    }

    /// Reads the committed value of `key` in `handle`.
    #[must_use]
    pub fn read(&self, handle: &CollectionHandle, key: &[u8]) -> Option<VersionedValue> {
        handle.read(key)
    }

    /// Folds a committed record into the collections.
    ///
    /// Records must arrive one at a time in strictly increasing, gap-free
    /// sequence order. All collections the record touches are locked together,
    /// so no reader sees half of a record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for an out-of-order record and `InvalidArgument`
    /// for a write to an unnamed collection. The store is unchanged on error.
    pub fn apply_committed(&self, record: &LogRecord) -> CoreResult<()> {
        let mut applied = self.applied.lock();
        if record.sequence != applied.next() {
            return Err(CoreError::invalid_state(format!(
                "cannot apply {} after {}",
                record.sequence, *applied
            )));
        }

        let mut targets: BTreeMap<&str, CollectionHandle> = BTreeMap::new();
        for write in &record.writes {
            if !targets.contains_key(write.collection.as_str()) {
                let handle = self.get_or_create(&write.collection)?;
                targets.insert(write.collection.as_str(), handle);
            }
        }

        {
            let mut guards: BTreeMap<&str, _> = targets
                .iter()
                .map(|(name, handle)| (*name, handle.inner.entries.write()))
                .collect();
            for write in &record.writes {
                if let Some(entries) = guards.get_mut(write.collection.as_str()) {
                    entries.insert(
                        write.key.clone(),
                        collection::Slot {
                            value: write.value.clone(),
                            version: record.sequence,
                        },
                    );
                }
            }
        }

        *applied = record.sequence;
        Ok(())
    }

    /// Replays committed records from `log` up to and including `upto`.
    ///
    /// Starts after the current watermark, so calling it on a fresh store
    /// replays from sequence 1. Returns the number of records applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or a record is out of order.
    pub fn replay(&self, log: &Log, upto: CommitSeq) -> CoreResult<usize> {
        let mut count = 0;
        for record in log.read(self.applied_seq().next()).until(upto) {
            self.apply_committed(&record?)?;
            count += 1;
        }
        Ok(count)
    }

    /// Sequence of the last applied record.
    #[must_use]
    pub fn applied_seq(&self) -> CommitSeq {
        *self.applied.lock()
    }

    /// Names of all collections, sorted.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every entry (removed keys included), sorted by collection then key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SnapshotRow> {
        let handles: Vec<CollectionHandle> = self.collections.read().values().cloned().collect();
        let mut rows = Vec::new();
        for handle in handles {
            let entries = handle.inner.entries.read();
            rows.extend(entries.iter().map(|(key, slot)| SnapshotRow {
                collection: handle.name().to_string(),
                key: key.clone(),
                value: slot.value.clone(),
                version: slot.version,
            }));
        }
        rows.sort();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogWrite;
    use crate::types::{Term, TransactionId};
    use std::thread;

    fn record(seq: u64, writes: &[(&str, &[u8], Option<&[u8]>)]) -> LogRecord {
        LogRecord {
            sequence: CommitSeq::new(seq),
            term: Term::new(1),
            txid: TransactionId::new(seq),
            writes: writes
                .iter()
                .map(|(collection, key, value)| LogWrite {
                    collection: (*collection).to_string(),
                    key: key.to_vec(),
                    value: value.map(<[u8]>::to_vec),
                })
                .collect(),
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let store = CollectionStore::new();
        let first = store.get_or_create("counters").unwrap();
        let second = store.get_or_create("counters").unwrap();
        assert!(first.same_collection(&second));
        assert_eq!(store.collection_names(), vec!["counters".to_string()]);
    }

    #[test]
    fn concurrent_creation_yields_one_collection() {
        let store = Arc::new(CollectionStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get_or_create("sessions").unwrap())
            })
            .collect();
        let created: Vec<CollectionHandle> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(created.iter().all(|h| h.same_collection(&created[0])));
        assert_eq!(store.collection_names().len(), 1);
    }

    #[test]
    fn empty_name_rejected() {
        let store = CollectionStore::new();
        assert!(matches!(
            store.get_or_create(""),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn apply_sets_value_and_version() {
        let store = CollectionStore::new();
        store
            .apply_committed(&record(1, &[("counters", b"hits", Some(&[1]))]))
            .unwrap();
        store
            .apply_committed(&record(2, &[("counters", b"hits", Some(&[2]))]))
            .unwrap();

        let counters = store.get("counters").unwrap();
        let current = store.read(&counters, b"hits").unwrap();
        assert_eq!(current.value, vec![2]);
        assert_eq!(current.version, CommitSeq::new(2));
        assert_eq!(store.applied_seq(), CommitSeq::new(2));
    }

    #[test]
    fn out_of_order_apply_leaves_store_untouched() {
        let store = CollectionStore::new();
        store
            .apply_committed(&record(1, &[("c", b"k", Some(&[1]))]))
            .unwrap();
        let before = store.snapshot();

        for seq in [1, 3] {
            let err = store
                .apply_committed(&record(seq, &[("c", b"k", Some(&[9]))]))
                .unwrap_err();
            assert!(matches!(err, CoreError::InvalidState { .. }));
        }
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn removal_keeps_version() {
        let store = CollectionStore::new();
        store
            .apply_committed(&record(1, &[("c", b"k", Some(&[1]))]))
            .unwrap();
        store.apply_committed(&record(2, &[("c", b"k", None)])).unwrap();

        let handle = store.get("c").unwrap();
        assert!(handle.read(b"k").is_none());
        assert_eq!(handle.version_of(b"k"), Some(CommitSeq::new(2)));
        assert!(handle.is_empty());
        assert_eq!(
            handle.observe(b"k"),
            Observation {
                value: None,
                version: Some(CommitSeq::new(2))
            }
        );
        assert_eq!(handle.observe(b"never").version, None);
    }

    #[test]
    fn record_spanning_collections_applies_together() {
        let store = CollectionStore::new();
        store
            .apply_committed(&record(
                1,
                &[("a", b"x", Some(&[1])), ("b", b"y", Some(&[2])), ("a", b"z", Some(&[3]))],
            ))
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|row| row.version == CommitSeq::new(1)));
        assert_eq!(store.get("a").unwrap().keys(), vec![b"x".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn barrier_advances_watermark_only() {
        let store = CollectionStore::new();
        store.apply_committed(&record(1, &[])).unwrap();
        assert_eq!(store.applied_seq(), CommitSeq::new(1));
        assert!(store.snapshot().is_empty());
    }
}
