//! Test fixtures and replica helpers.
//!
//! Provides single replicas with automatic cleanup and in-process clusters
//! whose members can be crashed, restarted and cut off from the network.

use quorumdb_core::{
    CancellationToken, ClusterConfig, CollectionHandle, CommitSeq, Config, CoreResult,
    LoopbackNetwork, Replica, ReplicaId, Role, SnapshotRow, Term, Transaction,
};
use quorumdb_protocol::{ReplicationMessage, VoteRequest};
use quorumdb_storage::InMemoryBackend;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Timing used by test clusters: short enough for fast tests, with heartbeats
/// well inside the election timeout.
pub fn test_config() -> Config {
    Config::new()
        .replication_timeout(Duration::from_millis(300))
        .heartbeat_interval(Duration::from_millis(20))
        .election_timeout(Duration::from_millis(200))
}

/// A single replica with automatic cleanup.
pub struct TestReplica {
    /// The replica instance.
    pub replica: Replica,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestReplica {
    /// Creates a new in-memory single replica.
    pub fn memory() -> Self {
        Self {
            replica: Replica::open_in_memory().expect("Failed to open in-memory replica"),
            _temp_dir: None,
        }
    }

    /// Creates a new single replica in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let replica = open_single_dir(temp_dir.path()).expect("Failed to open file replica");
        Self {
            replica,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the data directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }
}

impl std::ops::Deref for TestReplica {
    type Target = Replica;

    fn deref(&self) -> &Self::Target {
        &self.replica
    }
}

/// Opens a single-member replica over a data directory.
pub fn open_single_dir(path: &Path) -> CoreResult<Replica> {
    let id = ReplicaId::new(0);
    Replica::open_dir(
        path,
        Config::default(),
        ClusterConfig::single(id),
        LoopbackNetwork::new().transport_for(id),
    )
}

/// Opens a single-member replica over `backend`.
///
/// The backend is shared, so opening again over the same backend after the
/// replica is dropped simulates a restart.
pub fn open_single(backend: &InMemoryBackend) -> CoreResult<Replica> {
    let id = ReplicaId::new(0);
    Replica::open(
        Config::default(),
        ClusterConfig::single(id),
        Box::new(backend.clone()),
        LoopbackNetwork::new().transport_for(id),
    )
}

/// Runs a test with a temporary in-memory replica.
pub fn with_temp_replica<F, R>(f: F) -> R
where
    F: FnOnce(&Replica) -> R,
{
    let test_replica = TestReplica::memory();
    f(&test_replica.replica)
}

/// Runs a test with a replica in a temporary directory.
pub fn with_file_replica<F, R>(f: F) -> R
where
    F: FnOnce(&Replica, &Path) -> R,
{
    let test_replica = TestReplica::file();
    let path = test_replica
        .path()
        .expect("File replica should have a path")
        .to_path_buf();
    f(&test_replica.replica, &path)
}

/// Stages `value` for `key` inside `tx`, ignoring the current value.
pub fn set(
    replica: &Replica,
    tx: &mut Transaction,
    collection: &CollectionHandle,
    key: &[u8],
    value: &[u8],
) -> CoreResult<Vec<u8>> {
    replica.compute_and_set(
        tx,
        collection,
        key,
        |_, _| Ok(value.to_vec()),
        Duration::from_secs(1),
        &CancellationToken::new(),
    )
}

/// Stages `current + 1` for a one-byte counter.
pub fn increment(
    replica: &Replica,
    tx: &mut Transaction,
    collection: &CollectionHandle,
    key: &[u8],
) -> CoreResult<u8> {
    let staged = replica.compute_and_set(
        tx,
        collection,
        key,
        |_, current| Ok(vec![current.map_or(0, |v| v[0]) + 1]),
        Duration::from_secs(1),
        &CancellationToken::new(),
    )?;
    Ok(staged[0])
}

/// Commits one write of `value` to `key` in its own transaction.
pub fn put(replica: &Replica, collection: &str, key: &[u8], value: &[u8]) -> CoreResult<CommitSeq> {
    let handle = replica.collection(collection)?;
    let mut tx = replica.begin();
    if let Err(e) = set(replica, &mut tx, &handle, key, value) {
        replica.close(&mut tx);
        return Err(e);
    }
    replica.commit(&mut tx)
}

/// Returns a copy of the first `keep` bytes of a log, as left by a crash
/// in the middle of a write.
pub fn torn_copy(backend: &InMemoryBackend, keep: usize) -> InMemoryBackend {
    let mut bytes = backend.data();
    bytes.truncate(keep);
    InMemoryBackend::with_data(bytes)
}

/// Sends a vote request for `term` from `candidate` straight to `replica`.
///
/// Returns whether the vote was granted.
pub fn request_vote(
    replica: &Replica,
    term: u64,
    candidate: u32,
    last_seq: u64,
    last_term: u64,
) -> CoreResult<bool> {
    let reply = replica.handle_message(ReplicationMessage::VoteRequest(VoteRequest {
        term,
        candidate,
        last_seq,
        last_term,
    }))?;
    match reply {
        ReplicationMessage::VoteGrant(grant) => Ok(grant.granted),
        other => panic!("expected a vote grant, got type {}", other.type_code()),
    }
}

/// An in-process cluster over a [`LoopbackNetwork`].
///
/// Each member keeps its log in an [`InMemoryBackend`] that survives
/// [`TestCluster::crash`], so [`TestCluster::restart`] recovers exactly what
/// the member had persisted.
pub struct TestCluster {
    network: LoopbackNetwork,
    config: Config,
    backends: Vec<InMemoryBackend>,
    replicas: Vec<Option<Replica>>,
}

impl TestCluster {
    /// Starts `size` replicas with ids `0..size`, none of them Primary yet.
    pub fn new(size: u32) -> Self {
        Self::with_config(size, test_config())
    }

    /// Starts `size` replicas with the given timing.
    pub fn with_config(size: u32, config: Config) -> Self {
        let mut cluster = Self {
            network: LoopbackNetwork::new(),
            config,
            backends: (0..size).map(|_| InMemoryBackend::new()).collect(),
            replicas: (0..size).map(|_| None).collect(),
        };
        for id in 0..size {
            cluster.restart(id);
        }
        cluster
    }

    /// Starts a cluster and elects replica 0.
    pub fn with_primary(size: u32) -> Self {
        let cluster = Self::new(size);
        assert!(cluster.elect(0), "replica 0 failed to win the first election");
        cluster
    }

    /// Number of members.
    pub fn size(&self) -> u32 {
        self.replicas.len() as u32
    }

    /// The network connecting the members.
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    /// Returns the running replica `id`.
    ///
    /// # Panics
    ///
    /// Panics if the replica is crashed.
    pub fn replica(&self, id: u32) -> &Replica {
        self.replicas[id as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("replica {id} is not running"))
    }

    /// Returns true if replica `id` is running.
    pub fn is_running(&self, id: u32) -> bool {
        self.replicas[id as usize].is_some()
    }

    /// The log storage of replica `id`, shared with the running instance.
    pub fn backend(&self, id: u32) -> &InMemoryBackend {
        &self.backends[id as usize]
    }

    /// Running replicas with their ids.
    pub fn running(&self) -> impl Iterator<Item = (u32, &Replica)> {
        self.replicas
            .iter()
            .enumerate()
            .filter_map(|(id, replica)| replica.as_ref().map(|r| (id as u32, r)))
    }

    /// Ids of running replicas that currently believe they are Primary.
    pub fn primaries(&self) -> Vec<u32> {
        self.running()
            .filter(|(_, replica)| replica.role() == Role::Primary)
            .map(|(id, _)| id)
            .collect()
    }

    /// Makes replica `id` campaign now. Returns true if it won.
    pub fn elect(&self, id: u32) -> bool {
        self.replica(id).campaign().expect("campaign failed")
    }

    /// Stops replica `id` abruptly. Its log storage is kept.
    pub fn crash(&mut self, id: u32) {
        self.network.disconnect(ReplicaId::new(id));
        self.replicas[id as usize] = None;
    }

    /// (Re)opens replica `id` over its persisted log and reconnects it.
    pub fn restart(&mut self, id: u32) {
        let replica_id = ReplicaId::new(id);
        let replica = Replica::open(
            self.config.clone(),
            ClusterConfig::with_size(replica_id, self.size()),
            Box::new(self.backends[id as usize].clone()),
            self.network.transport_for(replica_id),
        )
        .expect("Failed to open cluster replica");
        self.network.register(replica_id, &replica.handler());
        self.replicas[id as usize] = Some(replica);
        self.network.reconnect(replica_id);
    }

    /// Cuts replica `id` off from every other member.
    pub fn disconnect(&self, id: u32) {
        self.network.disconnect(ReplicaId::new(id));
    }

    /// Undoes [`TestCluster::disconnect`].
    pub fn reconnect(&self, id: u32) {
        self.network.reconnect(ReplicaId::new(id));
    }

    /// Ticks every running replica once.
    pub fn tick_all(&self) {
        for (id, replica) in self.running() {
            if let Err(e) = replica.tick() {
                panic!("tick on replica {id} failed: {e}");
            }
        }
    }

    /// Ticks the cluster until `condition` holds.
    ///
    /// Returns false if it still does not hold after `timeout`.
    pub fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.tick_all();
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Ticks until every running replica has applied the Primary's commits.
    pub fn settle(&self) -> bool {
        self.wait_until(Duration::from_secs(2), |cluster| {
            let Some(&primary) = cluster.primaries().first() else {
                return false;
            };
            let commit = cluster.replica(primary).commit_seq();
            cluster.running().all(|(id, replica)| {
                cluster.network.is_disconnected(ReplicaId::new(id))
                    || replica.commit_seq() == commit
            })
        })
    }

    /// Collection contents of replica `id`.
    pub fn snapshot(&self, id: u32) -> Vec<SnapshotRow> {
        self.replica(id).store().snapshot()
    }

    /// Highest term any running replica is in.
    pub fn max_term(&self) -> Term {
        self.running()
            .map(|(_, replica)| replica.term())
            .max()
            .unwrap_or(Term::ZERO)
    }
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for (id, replica) in self.replicas.iter().enumerate() {
            match replica {
                Some(replica) => list.entry(replica),
                None => list.entry(&format_args!("replica-{id} (crashed)")),
            };
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_replica_is_primary() {
        let replica = TestReplica::memory();
        assert_eq!(replica.role(), Role::Primary);
        assert!(replica.path().is_none());
    }

    #[test]
    fn file_replica_persists() {
        with_file_replica(|replica, path| {
            put(replica, "things", b"k", b"v").unwrap();
            assert!(path.join("replica.log").exists());
        });
    }

    #[test]
    fn cluster_elects_and_settles() {
        let cluster = TestCluster::with_primary(3);
        assert_eq!(cluster.primaries(), vec![0]);

        put(cluster.replica(0), "things", b"k", b"v").unwrap();
        assert!(cluster.settle());
        for (_, replica) in cluster.running() {
            assert_eq!(replica.commit_seq(), CommitSeq::new(1));
        }
    }

    #[test]
    fn restart_recovers_log() {
        let mut cluster = TestCluster::with_primary(3);
        put(cluster.replica(0), "things", b"k", b"v").unwrap();
        assert!(cluster.settle());

        let before = cluster.snapshot(2);
        cluster.crash(2);
        assert!(!cluster.is_running(2));
        cluster.restart(2);
        assert_eq!(cluster.snapshot(2), before);
    }

    #[test]
    fn torn_copy_keeps_prefix() {
        let backend = InMemoryBackend::with_data(vec![1, 2, 3, 4]);
        assert_eq!(torn_copy(&backend, 2).data(), vec![1, 2]);
    }
}
