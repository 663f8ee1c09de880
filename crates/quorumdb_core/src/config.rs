//! Engine and cluster configuration.

use crate::error::{CoreError, CoreResult};
use crate::types::ReplicaId;
use std::time::Duration;

/// Configuration for a replica.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether every log append is flushed before it is acknowledged.
    pub sync_on_append: bool,

    /// How long a commit waits for quorum before failing with `Unavailable`.
    pub replication_timeout: Duration,

    /// Interval between Primary heartbeats.
    pub heartbeat_interval: Duration,

    /// Base silence after which a Secondary campaigns. A random extra of up to
    /// the same amount is added per replica to avoid split votes.
    pub election_timeout: Duration,

    /// How many times `compute_and_set` re-runs the compute function when the
    /// key changes underneath it before reporting `Conflict`.
    pub compute_retry_limit: u32,

    /// Maximum number of records shipped in one append request.
    pub max_batch_records: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_on_append: true,
            replication_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: Duration::from_millis(500),
            compute_retry_limit: 3,
            max_batch_records: 256,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether appends are flushed before acknowledgement.
    #[must_use]
    pub const fn sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = value;
        self
    }

    /// Sets the quorum wait bound.
    #[must_use]
    pub const fn replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the base election timeout.
    #[must_use]
    pub const fn election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Sets the compute retry limit.
    #[must_use]
    pub const fn compute_retry_limit(mut self, limit: u32) -> Self {
        self.compute_retry_limit = limit;
        self
    }

    /// Sets the append batch size.
    #[must_use]
    pub const fn max_batch_records(mut self, records: usize) -> Self {
        self.max_batch_records = records;
        self
    }

    /// Checks that the timing values can work together.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a bound is zero or heartbeats are not more
    /// frequent than elections.
    pub fn validate(&self) -> CoreResult<()> {
        if self.replication_timeout.is_zero() {
            return Err(CoreError::invalid_argument(
                "replication_timeout must be positive",
            ));
        }
        if self.max_batch_records == 0 {
            return Err(CoreError::invalid_argument(
                "max_batch_records must be positive",
            ));
        }
        if self.heartbeat_interval >= self.election_timeout {
            return Err(CoreError::invalid_argument(
                "heartbeat_interval must be shorter than election_timeout",
            ));
        }
        Ok(())
    }
}

/// Static membership of the replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// This replica.
    pub replica_id: ReplicaId,
    /// All replicas, this one included.
    pub members: Vec<ReplicaId>,
}

impl ClusterConfig {
    /// Creates a cluster of `size` replicas with ids `0..size`.
    #[must_use]
    pub fn with_size(replica_id: ReplicaId, size: u32) -> Self {
        Self {
            replica_id,
            members: (0..size).map(ReplicaId::new).collect(),
        }
    }

    /// Creates a one-replica cluster, where the replica is its own quorum.
    #[must_use]
    pub fn single(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            members: vec![replica_id],
        }
    }

    /// Number of replicas needed for a strict majority.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// All members except this replica.
    pub fn peers(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.members
            .iter()
            .copied()
            .filter(move |id| *id != self.replica_id)
    }

    /// Checks membership consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty member list, duplicates, or a
    /// replica id that is not a member.
    pub fn validate(&self) -> CoreResult<()> {
        if self.members.is_empty() {
            return Err(CoreError::invalid_argument("cluster has no members"));
        }
        let mut sorted = self.members.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.members.len() {
            return Err(CoreError::invalid_argument("duplicate cluster member"));
        }
        if !self.members.contains(&self.replica_id) {
            return Err(CoreError::invalid_argument(format!(
                "{} is not a cluster member",
                self.replica_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.sync_on_append);
        assert_eq!(config.compute_retry_limit, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .sync_on_append(false)
            .replication_timeout(Duration::from_millis(50))
            .compute_retry_limit(0)
            .max_batch_records(8);

        assert!(!config.sync_on_append);
        assert_eq!(config.replication_timeout, Duration::from_millis(50));
        assert_eq!(config.compute_retry_limit, 0);
        assert_eq!(config.max_batch_records, 8);
    }

    #[test]
    fn heartbeat_must_beat_election() {
        let config = Config::new()
            .heartbeat_interval(Duration::from_secs(1))
            .election_timeout(Duration::from_millis(500));
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn majority_sizes() {
        assert_eq!(ClusterConfig::single(ReplicaId::new(0)).majority(), 1);
        assert_eq!(ClusterConfig::with_size(ReplicaId::new(0), 2).majority(), 2);
        assert_eq!(ClusterConfig::with_size(ReplicaId::new(0), 3).majority(), 2);
        assert_eq!(ClusterConfig::with_size(ReplicaId::new(0), 5).majority(), 3);
    }

    #[test]
    fn peers_exclude_self() {
        let cluster = ClusterConfig::with_size(ReplicaId::new(1), 3);
        let peers: Vec<_> = cluster.peers().collect();
        assert_eq!(peers, vec![ReplicaId::new(0), ReplicaId::new(2)]);
    }

    #[test]
    fn membership_validation() {
        assert!(ClusterConfig::with_size(ReplicaId::new(2), 3).validate().is_ok());
        assert!(ClusterConfig::with_size(ReplicaId::new(3), 3).validate().is_err());

        let duplicated = ClusterConfig {
            replica_id: ReplicaId::new(0),
            members: vec![ReplicaId::new(0), ReplicaId::new(0)],
        };
        assert!(duplicated.validate().is_err());
    }
}
