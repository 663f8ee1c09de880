//! Transaction manager.

use crate::error::{CoreError, CoreResult};
use crate::replication::{PendingRecords, ReplicationCoordinator};
use crate::stats::EngineStats;
use crate::store::{CollectionHandle, CollectionStore};
use crate::transaction::cancel::CancellationToken;
use crate::transaction::state::{ActiveSet, Transaction, TransactionState};
use crate::types::{CommitSeq, TransactionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs transactions against the collection store with optimistic
/// concurrency control.
///
/// ## Isolation
///
/// Transactions read committed state and record the version they observed
/// for every key. Writes are staged privately. At commit the observed
/// versions are validated against the store and against records that are
/// appended but not yet applied; any mismatch aborts with `Conflict`.
///
/// ## Durability
///
/// A transaction is committed only once its record reached quorum through
/// the [`ReplicationCoordinator`].
pub struct TransactionManager {
    store: Arc<CollectionStore>,
    stats: Arc<EngineStats>,
    /// How often `compute_and_set` re-runs the compute function.
    compute_retry_limit: u32,
    next_txid: AtomicU64,
    active: ActiveSet,
}

impl TransactionManager {
    /// Creates a manager that hands out ids starting at `first_txid`.
    ///
    /// Pass one past the highest id found in the log so ids are never reused
    /// across restarts.
    pub fn new(
        store: Arc<CollectionStore>,
        stats: Arc<EngineStats>,
        compute_retry_limit: u32,
        first_txid: TransactionId,
    ) -> Self {
        Self {
            store,
            stats,
            compute_retry_limit,
            next_txid: AtomicU64::new(first_txid.as_u64().max(1)),
            active: ActiveSet::default(),
        }
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> Transaction {
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        self.stats.record_transaction_start();
        debug!(txid = id.as_u64(), "transaction started");
        Transaction::new(id, Some(Arc::clone(&self.active)))
    }

    /// Returns the collection called `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty name.
    pub fn collection(&self, name: &str) -> CoreResult<CollectionHandle> {
        self.store.get_or_create(name)
    }

    /// Reads `key`, computes a new value and stages it.
    ///
    /// `compute` receives the key and the current value (`None` if the key is
    /// absent). If the transaction already staged the key, `compute` sees the
    /// staged value. Otherwise the observed version is added to the read set.
    ///
    /// `compute` must be pure: it is invoked again when the key changes
    /// between the read and staging, up to the configured retry limit.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the read and compute did not finish within `timeout`
    /// - `Cancelled` if `cancel` was signalled before staging
    /// - `Conflict` if the key kept changing underneath the compute
    /// - whatever `compute` returns
    ///
    /// On any error the transaction's read and write sets are unchanged for
    /// this key.
    pub fn compute_and_set<F>(
        &self,
        tx: &mut Transaction,
        collection: &CollectionHandle,
        key: &[u8],
        mut compute: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<u8>>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> CoreResult<Vec<u8>>,
    {
        tx.ensure_active()?;
        let deadline = Instant::now().checked_add(timeout);
        let name = collection.name();

        checkpoint(deadline, cancel)?;
        if let Some(staged) = tx.staged(name, key).cloned() {
            checkpoint(deadline, cancel)?;
            let value = compute(key, staged.as_deref())?;
            checkpoint(deadline, cancel)?;
            tx.stage(name, key, Some(value.clone()));
            self.stats.record_compute();
            return Ok(value);
        }

        let mut retries = 0;
        loop {
            let observation = collection.observe(key);
            checkpoint(deadline, cancel)?;
            let value = compute(key, observation.value.as_deref())?;
            checkpoint(deadline, cancel)?;

            if collection.version_of(key) == observation.version {
                tx.record_read(name, key, observation.version);
                tx.stage(name, key, Some(value.clone()));
                self.stats.record_compute();
                return Ok(value);
            }
            if retries >= self.compute_retry_limit {
                self.stats.record_conflict();
                debug!(
                    txid = tx.id().as_u64(),
                    collection = name,
                    retries,
                    "key kept changing during compute"
                );
                return Err(CoreError::conflict(name, key));
            }
            retries += 1;
            self.stats.record_compute_retry();
        }
    }

    /// Transactional read: sees the transaction's own staged writes and
    /// records the observed version otherwise.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the transaction is terminal.
    pub fn get(
        &self,
        tx: &mut Transaction,
        collection: &CollectionHandle,
        key: &[u8],
    ) -> CoreResult<Option<Vec<u8>>> {
        tx.ensure_active()?;
        self.stats.record_read();
        if let Some(staged) = tx.staged(collection.name(), key) {
            return Ok(staged.clone());
        }
        let observation = collection.observe(key);
        tx.record_read(collection.name(), key, observation.version);
        Ok(observation.value)
    }

    /// Stages removal of `key` and returns the value it had.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the transaction is terminal.
    pub fn remove(
        &self,
        tx: &mut Transaction,
        collection: &CollectionHandle,
        key: &[u8],
    ) -> CoreResult<Option<Vec<u8>>> {
        tx.ensure_active()?;
        let name = collection.name();
        let previous = match tx.staged(name, key) {
            Some(staged) => staged.clone(),
            None => {
                let observation = collection.observe(key);
                tx.record_read(name, key, observation.version);
                observation.value
            }
        };
        tx.stage(name, key, None);
        self.stats.record_remove();
        Ok(previous)
    }

    /// Checks the read set against the store and the pending records.
    fn validate(&self, tx: &Transaction, pending: &PendingRecords<'_>) -> CoreResult<()> {
        for ((collection, key), observed) in tx.read_set() {
            if pending.touches(collection, key) {
                return Err(CoreError::conflict(collection.as_str(), key.as_slice()));
            }
            let current = self
                .store
                .get(collection)
                .and_then(|handle| handle.version_of(key));
            if current != *observed {
                return Err(CoreError::conflict(collection.as_str(), key.as_slice()));
            }
        }
        Ok(())
    }

    /// Commits a transaction.
    ///
    /// A transaction without writes only validates its reads and returns the
    /// current applied sequence. Otherwise its record is appended and
    /// replicated; the returned sequence is the version of every key it wrote.
    ///
    /// Any failure aborts the transaction.
    ///
    /// # Errors
    ///
    /// - `Conflict` if a read was invalidated
    /// - `NotPrimary` if this replica cannot accept writes
    /// - `Unavailable` if no quorum acknowledged the record in time
    /// - `InvalidState` if the transaction is not active
    pub fn commit(
        &self,
        tx: &mut Transaction,
        coordinator: &ReplicationCoordinator,
    ) -> CoreResult<CommitSeq> {
        tx.ensure_active()?;
        tx.mark_committing();

        let result = if tx.write_count() == 0 {
            coordinator
                .with_pending(|pending| self.validate(tx, pending))
                .map(|()| self.store.applied_seq())
        } else {
            let writes = tx.log_writes();
            let snapshot: &Transaction = tx;
            coordinator
                .propose(snapshot.id(), writes, |pending| self.validate(snapshot, pending))
                .and_then(|record| coordinator.await_commit(&record))
        };

        match result {
            Ok(seq) => {
                tx.mark_committed();
                self.stats.record_transaction_commit();
                debug!(txid = tx.id().as_u64(), seq = seq.as_u64(), "transaction committed");
                Ok(seq)
            }
            Err(e) => {
                tx.mark_aborted();
                if matches!(e, CoreError::Conflict { .. }) {
                    self.stats.record_conflict();
                }
                self.stats.record_transaction_abort();
                debug!(txid = tx.id().as_u64(), error = %e, "commit failed, transaction aborted");
                Err(e)
            }
        }
    }

    /// Aborts a transaction, discarding its staged writes.
    ///
    /// Aborting a terminal transaction changes nothing and is logged.
    pub fn abort(&self, tx: &mut Transaction) {
        self.finish(tx, "abort");
    }

    /// Ends a transaction's life, aborting it if still active.
    ///
    /// Closing a committed transaction is the normal end of its life; closing
    /// an aborted one is logged.
    pub fn close(&self, tx: &mut Transaction) {
        if tx.state() == TransactionState::Committed {
            return;
        }
        self.finish(tx, "close");
    }

    fn finish(&self, tx: &mut Transaction, operation: &str) {
        match tx.state() {
            TransactionState::Active => {
                tx.mark_aborted();
                self.stats.record_transaction_abort();
                debug!(txid = tx.id().as_u64(), operation, "transaction aborted");
            }
            state => {
                warn!(
                    txid = tx.id().as_u64(),
                    ?state,
                    operation,
                    "transaction already finished"
                );
            }
        }
    }

    /// Number of transactions not yet committed or aborted.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txid", &self.next_txid.load(Ordering::SeqCst))
            .field("active", &self.active_count())
            .field("compute_retry_limit", &self.compute_retry_limit)
            .finish_non_exhaustive()
    }
}

/// Fails with `Cancelled` or `Timeout` at a suspend point.
fn checkpoint(deadline: Option<Instant>, cancel: &CancellationToken) -> CoreResult<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(CoreError::timeout("compute_and_set"));
    }
    Ok(())
}
