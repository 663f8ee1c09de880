//! A single named collection.

use crate::types::Version;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A committed value together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// The value bytes.
    pub value: Vec<u8>,
    /// Sequence of the record that wrote the value.
    pub version: Version,
}

/// What a transaction saw when it looked at a key.
///
/// `version` is `None` only for a key that was never written (the absent
/// sentinel). A removed key has no value but keeps the version of its removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Current value, if the key is live.
    pub value: Option<Vec<u8>>,
    /// Version of the last write to the key.
    pub version: Option<Version>,
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub value: Option<Vec<u8>>,
    pub version: Version,
}

#[derive(Debug)]
pub(crate) struct Collection {
    pub name: String,
    pub entries: RwLock<BTreeMap<Vec<u8>, Slot>>,
}

/// Shared handle to a collection.
///
/// Handles are cheap to clone; all clones for one name refer to the same
/// collection object. Handles only read; entries change solely through
/// [`super::CollectionStore::apply_committed`].
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    pub(crate) inner: Arc<Collection>,
}

impl CollectionHandle {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Collection {
                name: name.to_string(),
                entries: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Reads the committed value and version of `key`.
    #[must_use]
    pub fn read(&self, key: &[u8]) -> Option<VersionedValue> {
        let entries = self.inner.entries.read();
        entries.get(key).and_then(|slot| {
            slot.value.as_ref().map(|value| VersionedValue {
                value: value.clone(),
                version: slot.version,
            })
        })
    }

    /// Reads value and version in one step, including removed keys.
    #[must_use]
    pub fn observe(&self, key: &[u8]) -> Observation {
        let entries = self.inner.entries.read();
        match entries.get(key) {
            Some(slot) => Observation {
                value: slot.value.clone(),
                version: Some(slot.version),
            },
            None => Observation {
                value: None,
                version: None,
            },
        }
    }

    /// Version of the last write to `key`, removals included.
    #[must_use]
    pub fn version_of(&self, key: &[u8]) -> Option<Version> {
        self.inner.entries.read().get(key).map(|slot| slot.version)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .values()
            .filter(|slot| slot.value.is_some())
            .count()
    }

    /// Returns true if no key is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys in byte order.
    #[must_use]
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns true if both handles refer to the same collection object.
    #[must_use]
    pub fn same_collection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
