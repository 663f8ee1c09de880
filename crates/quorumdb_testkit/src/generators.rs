//! Property-based test generators using proptest.
//!
//! Workloads are small on purpose: few collections and keys, so that
//! generated operations hit the same entries often.

use crate::fixtures::set;
use quorumdb_core::{CoreResult, Replica};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// One write a generated workload performs in its own transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Store `value` under `key`.
    Set {
        /// Collection name.
        collection: String,
        /// Key bytes.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove `key`.
    Remove {
        /// Collection name.
        collection: String,
        /// Key bytes.
        key: Vec<u8>,
    },
}

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for keys drawn from a small space.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..4, 1..3)
}

/// Strategy for values (arbitrary bytes).
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for one operation over up to three collections.
pub fn op_strategy() -> impl Strategy<Value = Op> {
    let collection = prop::sample::select(vec!["alpha", "beta", "gamma"]).prop_map(String::from);
    prop_oneof![
        3 => (collection.clone(), key_strategy(), value_strategy()).prop_map(
            |(collection, key, value)| Op::Set {
                collection,
                key,
                value,
            }
        ),
        1 => (collection, key_strategy())
            .prop_map(|(collection, key)| Op::Remove { collection, key }),
    ]
}

/// Strategy for a workload of `1..max` operations.
pub fn workload_strategy(max: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..max)
}

/// Commits every operation of `ops` on `replica`, one transaction each.
pub fn apply_ops(replica: &Replica, ops: &[Op]) -> CoreResult<()> {
    for op in ops {
        match op {
            Op::Set {
                collection,
                key,
                value,
            } => {
                let handle = replica.collection(collection)?;
                replica.run(|tx| set(replica, tx, &handle, key, value))?;
            }
            Op::Remove { collection, key } => {
                let handle = replica.collection(collection)?;
                replica.run(|tx| replica.remove(tx, &handle, key))?;
            }
        }
    }
    Ok(())
}

/// Expected live contents after `ops`, keyed by (collection, key).
pub fn expected_state(ops: &[Op]) -> BTreeMap<(String, Vec<u8>), Vec<u8>> {
    let mut state = BTreeMap::new();
    for op in ops {
        match op {
            Op::Set {
                collection,
                key,
                value,
            } => {
                state.insert((collection.clone(), key.clone()), value.clone());
            }
            Op::Remove { collection, key } => {
                state.remove(&(collection.clone(), key.clone()));
            }
        }
    }
    state
}
