//! Replica facade and recovery.

use crate::config::{ClusterConfig, Config};
use crate::dir::ReplicaDir;
use crate::error::CoreResult;
use crate::log::Log;
use crate::replication::{
    LoopbackNetwork, MessageHandler, ReplicaTransport, ReplicationCoordinator, Role,
};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{CollectionHandle, CollectionStore, VersionedValue};
use crate::transaction::{CancellationToken, RetryPolicy, Transaction, TransactionManager};
use crate::types::{CommitSeq, ReplicaId, Term, TransactionId};
use quorumdb_protocol::ReplicationMessage;
use quorumdb_storage::{InMemoryBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// One member of a replicated QuorumDB cluster.
///
/// `Replica` wires the log, the collection store, the transaction manager
/// and the replication coordinator together, and recovers state on open.
///
/// # Opening a Replica
///
/// ```rust,ignore
/// use quorumdb_core::{ClusterConfig, Config, LoopbackNetwork, Replica, ReplicaId};
/// use std::path::Path;
///
/// let network = LoopbackNetwork::new();
/// let id = ReplicaId::new(0);
/// let replica = Replica::open_dir(
///     Path::new("data/replica-0"),
///     Config::default(),
///     ClusterConfig::with_size(id, 3),
///     network.transport_for(id),
/// )?;
/// network.register(id, &replica.handler());
/// ```
///
/// # Transactions
///
/// ```rust,ignore
/// let counters = replica.collection("counters")?;
/// replica.run(|tx| {
///     replica.compute_and_set(tx, &counters, b"hits", |_, current| {
///         Ok(vec![current.map_or(0, |v| v[0]) + 1])
///     }, Duration::from_secs(1), &CancellationToken::new())
/// })?;
/// ```
///
/// The caller drives timers by calling [`Replica::tick`] at least every
/// `heartbeat_interval`.
pub struct Replica {
    config: Config,
    /// Data directory (holds the lock). `None` for caller-supplied storage.
    dir: Option<ReplicaDir>,
    log: Arc<Log>,
    store: Arc<CollectionStore>,
    stats: Arc<EngineStats>,
    coordinator: Arc<ReplicationCoordinator>,
    transactions: TransactionManager,
}

impl Replica {
    /// Opens a replica over caller-supplied log storage.
    ///
    /// Replays the log up to its durable commit watermark. Records beyond the
    /// watermark stay in doubt until the leadership protocol resolves them. A
    /// single-member cluster makes itself Primary right away.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an invalid configuration
    /// - `LogCorruption` or `ChecksumMismatch` for a damaged log
    /// - storage errors if the log cannot be read
    pub fn open(
        config: Config,
        cluster: ClusterConfig,
        backend: Box<dyn StorageBackend>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> CoreResult<Self> {
        config.validate()?;
        cluster.validate()?;

        let log = Arc::new(Log::open(backend, config.sync_on_append)?);
        let store = Arc::new(CollectionStore::new());
        let replayed = store.replay(&log, log.durable_commit())?;
        let first_txid = Self::next_txid(&log)?;

        let stats = Arc::new(EngineStats::new());
        let coordinator = Arc::new(ReplicationCoordinator::new(
            config.clone(),
            cluster.clone(),
            Arc::clone(&log),
            Arc::clone(&store),
            transport,
            Arc::clone(&stats),
        )?);
        let transactions = TransactionManager::new(
            Arc::clone(&store),
            Arc::clone(&stats),
            config.compute_retry_limit,
            first_txid,
        );

        info!(
            replica = cluster.replica_id.as_u32(),
            members = cluster.members.len(),
            replayed,
            in_doubt = log.last_seq().as_u64() - store.applied_seq().as_u64(),
            term = log.election().term.as_u64(),
            "replica recovered"
        );

        let replica = Self {
            config,
            dir: None,
            log,
            store,
            stats,
            coordinator,
            transactions,
        };
        if cluster.members.len() == 1 {
            replica.coordinator.campaign()?;
        }
        Ok(replica)
    }

    /// Opens a replica whose log lives in `path`.
    ///
    /// The directory is created if missing and locked for the lifetime of the
    /// replica.
    ///
    /// # Errors
    ///
    /// Returns `DataDirLocked` if another process holds the directory, plus
    /// everything [`Replica::open`] returns.
    pub fn open_dir(
        path: &Path,
        config: Config,
        cluster: ClusterConfig,
        transport: Arc<dyn ReplicaTransport>,
    ) -> CoreResult<Self> {
        let dir = ReplicaDir::open(path)?;
        let backend = dir.open_log()?;
        let mut replica = Self::open(config, cluster, Box::new(backend), transport)?;
        replica.dir = Some(dir);
        Ok(replica)
    }

    /// Opens a single-replica, in-memory engine. Useful for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the replica cannot make itself Primary.
    pub fn open_in_memory() -> CoreResult<Self> {
        let id = ReplicaId::new(0);
        Self::open(
            Config::default(),
            ClusterConfig::single(id),
            Box::new(InMemoryBackend::new()),
            LoopbackNetwork::new().transport_for(id),
        )
    }

    /// One past the highest transaction id in the log.
    fn next_txid(log: &Log) -> CoreResult<TransactionId> {
        let mut max = 0;
        for record in log.read(CommitSeq::new(1)) {
            max = max.max(record?.txid.as_u64());
        }
        Ok(TransactionId::new(max + 1))
    }

    /// Begins a transaction.
    pub fn begin(&self) -> Transaction {
        self.transactions.begin()
    }

    /// Returns the collection called `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty name.
    pub fn collection(&self, name: &str) -> CoreResult<CollectionHandle> {
        self.transactions.collection(name)
    }

    /// Reads `key`, computes its new value with `compute` and stages it.
    ///
    /// See [`TransactionManager::compute_and_set`].
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `Cancelled`, `Conflict`, or the error of `compute`.
    pub fn compute_and_set<F>(
        &self,
        tx: &mut Transaction,
        collection: &CollectionHandle,
        key: &[u8],
        compute: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<u8>>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> CoreResult<Vec<u8>>,
    {
        self.transactions
            .compute_and_set(tx, collection, key, compute, timeout, cancel)
    }

    /// Transactional read of `key`.
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
        self.transactions.get(tx, collection, key)
    }

    /// Stages removal of `key`, returning its previous value.
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
        self.transactions.remove(tx, collection, key)
    }

    /// Reads the committed value of `key` outside any transaction.
    ///
    /// On a Secondary the value may lag behind the Primary.
    #[must_use]
    pub fn read(&self, collection: &CollectionHandle, key: &[u8]) -> Option<VersionedValue> {
        self.store.read(collection, key)
    }

    /// Commits a transaction and returns its commit sequence.
    ///
    /// # Errors
    ///
    /// Returns `Conflict`, `NotPrimary`, `Unavailable` or `InvalidState`. The
    /// transaction is aborted on every error except `InvalidState`.
    pub fn commit(&self, tx: &mut Transaction) -> CoreResult<CommitSeq> {
        self.transactions.commit(tx, &self.coordinator)
    }

    /// Aborts a transaction.
    pub fn abort(&self, tx: &mut Transaction) {
        self.transactions.abort(tx);
    }

    /// Closes a transaction, aborting it if it is still active.
    pub fn close(&self, tx: &mut Transaction) {
        self.transactions.close(tx);
    }

    /// Runs `f` in a new transaction and commits it if `f` succeeds.
    ///
    /// The transaction is aborted if `f` fails.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of the commit.
    pub fn run<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                self.commit(&mut tx)?;
                Ok(value)
            }
            Err(e) => {
                self.close(&mut tx);
                Err(e)
            }
        }
    }

    /// Like [`Replica::run`], restarting the transaction from scratch on
    /// retryable errors as `policy` allows.
    ///
    /// # Errors
    ///
    /// Returns the last error once the policy gives up.
    pub fn run_with_retry<F, T>(&self, policy: RetryPolicy, mut f: F) -> CoreResult<T>
    where
        F: FnMut(&mut Transaction) -> CoreResult<T>,
    {
        let mut attempt = 1;
        loop {
            match self.run(&mut f) {
                Ok(value) => return Ok(value),
                Err(e) if policy.should_retry(attempt, &e) => {
                    let backoff = policy.backoff(attempt);
                    debug!(attempt, error = %e, ?backoff, "retrying transaction");
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles a message from another replica.
    ///
    /// # Errors
    ///
    /// Returns an error for non-request messages or local storage failures.
    pub fn handle_message(&self, message: ReplicationMessage) -> CoreResult<ReplicationMessage> {
        self.coordinator.handle(message)
    }

    /// Returns the handler to register with a transport server.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.coordinator.clone()
    }

    /// Drives heartbeats, retries and elections.
    ///
    /// # Errors
    ///
    /// Returns storage errors from persisting election state or commits.
    pub fn tick(&self) -> CoreResult<()> {
        self.coordinator.tick()
    }

    /// Starts an election now. Returns true if this replica is Primary after.
    ///
    /// # Errors
    ///
    /// Returns an error if the vote cannot be persisted.
    pub fn campaign(&self) -> CoreResult<bool> {
        self.coordinator.campaign()
    }

    /// This replica's id.
    #[must_use]
    pub fn id(&self) -> ReplicaId {
        self.coordinator.id()
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.coordinator.role()
    }

    /// Current term.
    #[must_use]
    pub fn term(&self) -> Term {
        self.coordinator.term()
    }

    /// Known Primary.
    #[must_use]
    pub fn leader(&self) -> Option<ReplicaId> {
        self.coordinator.leader()
    }

    /// Highest committed and applied sequence.
    #[must_use]
    pub fn commit_seq(&self) -> CommitSeq {
        self.coordinator.commit_seq()
    }

    /// Returns true if this replica is a Primary that accepts writes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.coordinator.is_ready()
    }

    /// Number of open transactions.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.transactions.active_count()
    }

    /// The collection store.
    #[must_use]
    pub fn store(&self) -> &CollectionStore {
        &self.store
    }

    /// The log.
    #[must_use]
    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Snapshot of the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Data directory, if the replica was opened with [`Replica::open_dir`].
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(ReplicaDir::path)
    }

    /// Flushes the log to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.log.flush()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("coordinator", &self.coordinator)
            .field("transactions", &self.transactions)
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use tempfile::tempdir;

    const LONG: Duration = Duration::from_secs(10);

    fn increment(_key: &[u8], current: Option<&[u8]>) -> CoreResult<Vec<u8>> {
        Ok(vec![current.map_or(0, |v| v[0]) + 1])
    }

    fn bump(replica: &Replica, key: &[u8]) -> CoreResult<Vec<u8>> {
        let counters = replica.collection("counters")?;
        replica.run(|tx| {
            replica.compute_and_set(tx, &counters, key, increment, LONG, &CancellationToken::new())
        })
    }

    #[test]
    fn in_memory_replica_is_primary() {
        let replica = Replica::open_in_memory().unwrap();
        assert_eq!(replica.role(), Role::Primary);
        assert!(replica.is_ready());
        assert_eq!(replica.leader(), Some(ReplicaId::new(0)));
    }

    #[test]
    fn run_commits_and_returns_value() {
        let replica = Replica::open_in_memory().unwrap();
        assert_eq!(bump(&replica, b"hits").unwrap(), vec![1]);
        assert_eq!(bump(&replica, b"hits").unwrap(), vec![2]);

        let counters = replica.collection("counters").unwrap();
        let current = replica.read(&counters, b"hits").unwrap();
        assert_eq!(current.value, vec![2]);
        assert_eq!(current.version, CommitSeq::new(2));
        assert_eq!(replica.active_transactions(), 0);
        assert_eq!(replica.stats().transactions_committed, 2);
    }

    #[test]
    fn run_aborts_on_error() {
        let replica = Replica::open_in_memory().unwrap();
        let counters = replica.collection("counters").unwrap();
        let result: CoreResult<()> = replica.run(|tx| {
            replica.compute_and_set(tx, &counters, b"hits", increment, LONG, &CancellationToken::new())?;
            Err(CoreError::invalid_argument("caller gave up"))
        });
        assert!(result.is_err());
        assert!(replica.read(&counters, b"hits").is_none());
        assert_eq!(replica.active_transactions(), 0);
        assert_eq!(replica.commit_seq(), CommitSeq::ZERO);
    }

    #[test]
    fn run_with_retry_restarts_after_conflict() {
        let replica = Replica::open_in_memory().unwrap();
        let counters = replica.collection("counters").unwrap();
        let mut attempts = 0;

        let value = replica
            .run_with_retry(RetryPolicy::default().initial_backoff(Duration::ZERO), |tx| {
                attempts += 1;
                let value = replica.compute_and_set(
                    tx,
                    &counters,
                    b"hits",
                    increment,
                    LONG,
                    &CancellationToken::new(),
                )?;
                if attempts == 1 {
                    // A competing commit invalidates this attempt's read.
                    bump(&replica, b"hits")?;
                }
                Ok(value)
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(value, vec![2]);
        assert_eq!(replica.read(&counters, b"hits").unwrap().value, vec![2]);
    }

    #[test]
    fn recovery_replays_committed_state() {
        let backend = InMemoryBackend::new();
        let id = ReplicaId::new(0);
        let open = || {
            Replica::open(
                Config::default(),
                ClusterConfig::single(id),
                Box::new(backend.clone()),
                LoopbackNetwork::new().transport_for(id),
            )
            .unwrap()
        };

        let before = {
            let replica = open();
            bump(&replica, b"hits").unwrap();
            bump(&replica, b"misses").unwrap();
            bump(&replica, b"hits").unwrap();
            replica.store().snapshot()
        };

        let replica = open();
        assert_eq!(replica.store().snapshot(), before);
        assert_eq!(replica.commit_seq(), CommitSeq::new(3));

        // Transaction ids continue past the recovered ones.
        assert!(replica.begin().id() > TransactionId::new(3));
    }

    #[test]
    fn open_dir_locks_and_persists() {
        let root = tempdir().unwrap();
        let id = ReplicaId::new(0);
        let open = || {
            Replica::open_dir(
                root.path(),
                Config::default(),
                ClusterConfig::single(id),
                LoopbackNetwork::new().transport_for(id),
            )
        };

        {
            let replica = open().unwrap();
            assert_eq!(replica.path(), Some(root.path()));
            bump(&replica, b"hits").unwrap();
            assert!(matches!(open(), Err(CoreError::DataDirLocked { .. })));
        }

        let replica = open().unwrap();
        let counters = replica.collection("counters").unwrap();
        assert_eq!(replica.read(&counters, b"hits").unwrap().value, vec![1]);
    }

    #[test]
    fn invalid_cluster_is_rejected() {
        let cluster = ClusterConfig {
            replica_id: ReplicaId::new(5),
            members: vec![ReplicaId::new(0)],
        };
        let result = Replica::open(
            Config::default(),
            cluster,
            Box::new(InMemoryBackend::new()),
            LoopbackNetwork::new().transport_for(ReplicaId::new(5)),
        );
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }
}
