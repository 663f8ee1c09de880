//! Replica roles and the volatile leadership state.

use crate::types::{CommitSeq, ReplicaId, Term};
use std::fmt;
use std::time::{Duration, Instant};

/// Role of a replica within its current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepts writes and drives replication.
    Primary,
    /// Replays the Primary's log and serves stale-tolerant reads.
    Secondary,
    /// Asking peers for votes.
    Candidate,
}

impl Role {
    /// Returns the role name as used in logs and CLI output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Candidate => "candidate",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leadership state guarded by the coordinator's state lock.
///
/// `term` always equals the durable election term; it is persisted before it
/// changes here.
#[derive(Debug)]
pub(crate) struct RoleState {
    pub role: Role,
    pub term: Term,
    pub leader: Option<ReplicaId>,
    /// Last contact from a legitimate Primary, or last granted vote.
    pub last_heard: Instant,
    /// Silence tolerated before campaigning; re-drawn on every reset.
    pub election_timeout: Duration,
    /// Start of the Primary's last replication round.
    pub last_round: Instant,
    /// A Primary accepts writes once its commit reaches this sequence.
    pub ready_at: CommitSeq,
}

impl RoleState {
    pub fn new(term: Term, election_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            role: Role::Secondary,
            term,
            leader: None,
            last_heard: now,
            election_timeout,
            last_round: now,
            ready_at: CommitSeq::ZERO,
        }
    }

    pub fn reset_election_timer(&mut self, election_timeout: Duration) {
        self.last_heard = Instant::now();
        self.election_timeout = election_timeout;
    }

    pub fn election_due(&self, now: Instant) -> bool {
        self.role != Role::Primary
            && now.saturating_duration_since(self.last_heard) >= self.election_timeout
    }

    pub fn round_due(&self, now: Instant, interval: Duration) -> bool {
        self.role == Role::Primary && now.saturating_duration_since(self.last_round) >= interval
    }
}
