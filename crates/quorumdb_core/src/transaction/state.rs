//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::log::LogWrite;
use crate::types::{TransactionId, Version};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Registry of transactions that have not reached a terminal state.
pub(crate) type ActiveSet = Arc<RwLock<HashSet<TransactionId>>>;

/// `(collection, key)` addressing used by the read and write sets.
pub type EntryKey = (String, Vec<u8>);

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Reads and staged writes are allowed.
    Active,
    /// Commit has been requested and is in progress.
    Committing,
    /// The record reached quorum and was applied.
    Committed,
    /// Writes were discarded.
    Aborted,
}

impl TransactionState {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// A unit of work against the engine.
///
/// Staged writes are private to the transaction until commit. Dropping an
/// active transaction aborts it.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    /// Observed version per entry; `None` is the absent sentinel.
    reads: BTreeMap<EntryKey, Option<Version>>,
    /// Pending value per entry; `None` stages a removal.
    writes: BTreeMap<EntryKey, Option<Vec<u8>>>,
    registry: Option<ActiveSet>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, registry: Option<ActiveSet>) -> Self {
        if let Some(registry) = &registry {
            registry.write().insert(id);
        }
        Self {
            id,
            state: TransactionState::Active,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            registry,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction still accepts operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns the staged value for an entry: `Some(None)` is a staged removal.
    #[must_use]
    pub fn staged(&self, collection: &str, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.writes.get(&(collection.to_string(), key.to_vec()))
    }

    /// Returns the version observed for an entry, if it was read.
    #[must_use]
    pub fn observed(&self, collection: &str, key: &[u8]) -> Option<Option<Version>> {
        self.reads
            .get(&(collection.to_string(), key.to_vec()))
            .copied()
    }

    /// Iterates the read set.
    pub fn read_set(&self) -> impl Iterator<Item = (&EntryKey, &Option<Version>)> {
        self.reads.iter()
    }

    /// Iterates the write set in `(collection, key)` order.
    pub fn write_set(&self) -> impl Iterator<Item = (&EntryKey, &Option<Vec<u8>>)> {
        self.writes.iter()
    }

    /// Returns the number of staged writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Records the version seen for an entry. The first observation wins.
    pub(crate) fn record_read(&mut self, collection: &str, key: &[u8], version: Option<Version>) {
        self.reads
            .entry((collection.to_string(), key.to_vec()))
            .or_insert(version);
    }

    /// Stages a value, or a removal when `value` is `None`.
    pub(crate) fn stage(&mut self, collection: &str, key: &[u8], value: Option<Vec<u8>>) {
        self.writes
            .insert((collection.to_string(), key.to_vec()), value);
    }

    /// Builds the log writes for this transaction's write set.
    pub(crate) fn log_writes(&self) -> Vec<LogWrite> {
        self.writes
            .iter()
            .map(|((collection, key), value)| LogWrite {
                collection: collection.clone(),
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    pub(crate) fn mark_committing(&mut self) {
        self.state = TransactionState::Committing;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
        self.finish();
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
        self.reads.clear();
        self.writes.clear();
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.write().remove(&self.id);
        }
    }

    /// Ensures the transaction is active.
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committing => Err(CoreError::invalid_state(format!(
                "{} is committing",
                self.id
            ))),
            TransactionState::Committed => Err(CoreError::invalid_state(format!(
                "{} already committed",
                self.id
            ))),
            TransactionState::Aborted => Err(CoreError::invalid_state(format!(
                "{} already aborted",
                self.id
            ))),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!(txid = self.id.as_u64(), "transaction dropped while active, aborting");
            self.mark_aborted();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommitSeq;

    fn create_txn() -> Transaction {
        Transaction::new(TransactionId::new(1), None)
    }

    #[test]
    fn new_transaction_is_active() {
        let txn = create_txn();
        assert!(txn.is_active());
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.write_count(), 0);
    }

    #[test]
    fn stage_overwrites_previous() {
        let mut txn = create_txn();
        txn.stage("counters", b"hits", Some(vec![1]));
        txn.stage("counters", b"hits", Some(vec![2]));

        assert_eq!(txn.write_count(), 1);
        assert_eq!(txn.staged("counters", b"hits"), Some(&Some(vec![2])));
    }

    #[test]
    fn removal_is_staged_as_none() {
        let mut txn = create_txn();
        txn.stage("sessions", b"s1", None);
        assert_eq!(txn.staged("sessions", b"s1"), Some(&None));
        assert_eq!(txn.log_writes()[0].value, None);
    }

    #[test]
    fn first_observation_is_kept() {
        let mut txn = create_txn();
        txn.record_read("counters", b"hits", Some(CommitSeq::new(1)));
        txn.record_read("counters", b"hits", Some(CommitSeq::new(5)));
        txn.record_read("counters", b"new", None);

        assert_eq!(
            txn.observed("counters", b"hits"),
            Some(Some(CommitSeq::new(1)))
        );
        assert_eq!(txn.observed("counters", b"new"), Some(None));
        assert_eq!(txn.observed("counters", b"unread"), None);
        assert_eq!(txn.read_set().count(), 2);
    }

    #[test]
    fn log_writes_follow_key_order() {
        let mut txn = create_txn();
        txn.stage("b", b"1", Some(vec![1]));
        txn.stage("a", b"2", Some(vec![2]));
        txn.stage("a", b"1", Some(vec![3]));

        let order: Vec<_> = txn
            .log_writes()
            .into_iter()
            .map(|w| (w.collection, w.key))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), b"1".to_vec()),
                ("a".to_string(), b"2".to_vec()),
                ("b".to_string(), b"1".to_vec()),
            ]
        );
    }

    #[test]
    fn terminal_states_reject_operations() {
        let mut committed = create_txn();
        committed.mark_committed();
        assert!(matches!(
            committed.ensure_active(),
            Err(CoreError::InvalidState { .. })
        ));

        let mut aborted = create_txn();
        aborted.stage("c", b"k", Some(vec![1]));
        aborted.mark_aborted();
        assert!(aborted.ensure_active().is_err());
        assert_eq!(aborted.write_count(), 0);
    }

    #[test]
    fn drop_deregisters_active_transaction() {
        let registry: ActiveSet = Arc::default();
        let txn = Transaction::new(TransactionId::new(7), Some(Arc::clone(&registry)));
        assert!(registry.read().contains(&TransactionId::new(7)));

        drop(txn);
        assert!(registry.read().is_empty());
    }
}
