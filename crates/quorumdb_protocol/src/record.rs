//! Log records as they travel between replicas.

use serde::{Deserialize, Serialize};

/// A single key write inside a replicated record.
///
/// `value: None` is a removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireWrite {
    /// Collection name.
    pub collection: String,
    /// Opaque key bytes.
    pub key: Vec<u8>,
    /// New value, or `None` to remove the key.
    pub value: Option<Vec<u8>>,
}

impl WireWrite {
    /// Creates a write that stores `value` under `key`.
    pub fn put(collection: impl Into<String>, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            collection: collection.into(),
            key,
            value: Some(value),
        }
    }

    /// Creates a write that removes `key`.
    pub fn remove(collection: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            collection: collection.into(),
            key,
            value: None,
        }
    }
}

/// A log record shipped from the Primary to a Secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Commit sequence number (log position, 1-based).
    pub seq: u64,
    /// Term in which the record was appended.
    pub term: u64,
    /// Originating transaction id; 0 for term barriers.
    pub txid: u64,
    /// Ordered writes.
    pub writes: Vec<WireWrite>,
}

impl WireRecord {
    /// Returns true for a write-less record a new Primary uses to confirm its log.
    #[must_use]
    pub fn is_barrier(&self) -> bool {
        self.writes.is_empty()
    }
}
