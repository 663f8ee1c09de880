//! Replication and election messages.

use crate::record::WireRecord;
use serde::{Deserialize, Serialize};

/// Any message exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Primary → Secondary: records to persist.
    AppendRequest(AppendRequest),
    /// Secondary → Primary: persistence acknowledgement.
    AppendAck(AppendAck),
    /// Candidate → replica: request for a vote.
    VoteRequest(VoteRequest),
    /// Replica → Candidate: vote decision.
    VoteGrant(VoteGrant),
    /// Primary → Secondary: liveness and commit watermark.
    Heartbeat(Heartbeat),
    /// Secondary → Primary: heartbeat answer.
    HeartbeatAck(HeartbeatAck),
}

impl ReplicationMessage {
    /// Returns the message type code.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            Self::AppendRequest(_) => 1,
            Self::AppendAck(_) => 2,
            Self::VoteRequest(_) => 3,
            Self::VoteGrant(_) => 4,
            Self::Heartbeat(_) => 5,
            Self::HeartbeatAck(_) => 6,
        }
    }

    /// Returns the term carried by the message.
    #[must_use]
    pub fn term(&self) -> u64 {
        match self {
            Self::AppendRequest(m) => m.term,
            Self::AppendAck(m) => m.term,
            Self::VoteRequest(m) => m.term,
            Self::VoteGrant(m) => m.term,
            Self::Heartbeat(m) => m.term,
            Self::HeartbeatAck(m) => m.term,
        }
    }

    /// Returns true for messages that expect a reply.
    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::AppendRequest(_) | Self::VoteRequest(_) | Self::Heartbeat(_)
        )
    }
}

/// Records for a Secondary to append after `prev_seq`.
///
/// The Secondary only accepts the batch if its own record at `prev_seq` was
/// appended in `prev_term`; otherwise it answers with `success: false` and the
/// Primary walks back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Primary's term.
    pub term: u64,
    /// Primary's replica id.
    pub leader: u32,
    /// Sequence immediately before the first record (0 for the log start).
    pub prev_seq: u64,
    /// Term of the record at `prev_seq` (0 for the log start).
    pub prev_term: u64,
    /// Records to append, in sequence order.
    pub records: Vec<WireRecord>,
    /// Primary's quorum-confirmed sequence.
    pub commit_seq: u64,
}

/// Answer to an [`AppendRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendAck {
    /// Responder's current term.
    pub term: u64,
    /// Responder's replica id.
    pub replica: u32,
    /// Whether the batch was durably appended.
    pub success: bool,
    /// On success the last sequence now matching the Primary; on failure a hint
    /// for where the Primary should resume.
    pub last_seq: u64,
}

/// Request for a vote in `term`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term.
    pub term: u64,
    /// Candidate's replica id.
    pub candidate: u32,
    /// Candidate's last log sequence.
    pub last_seq: u64,
    /// Term of the candidate's last log record.
    pub last_term: u64,
}

/// Answer to a [`VoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteGrant {
    /// Responder's current term.
    pub term: u64,
    /// Responder's replica id.
    pub replica: u32,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// Periodic liveness message from the Primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Primary's term.
    pub term: u64,
    /// Primary's replica id.
    pub leader: u32,
    /// Commit watermark the receiver may apply up to. Never above the
    /// receiver's confirmed match with the Primary's log.
    pub commit_seq: u64,
}

/// Answer to a [`Heartbeat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Responder's current term.
    pub term: u64,
    /// Responder's replica id.
    pub replica: u32,
    /// Responder's last log sequence.
    pub last_seq: u64,
}
