//! # QuorumDB Protocol
//!
//! Cluster-facing messages exchanged between replicas:
//!
//! - log replication: [`AppendRequest`] / [`AppendAck`]
//! - leadership election: [`VoteRequest`] / [`VoteGrant`]
//! - liveness: [`Heartbeat`] / [`HeartbeatAck`]
//!
//! Every message travels inside an [`Envelope`] stamped with the sender's
//! protocol version. A receiver accepts any version in
//! [`MIN_PROTOCOL_VERSION`]..=[`PROTOCOL_VERSION`], which lets a replica set be
//! upgraded one node at a time.
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ```rust
//! use quorumdb_protocol::{decode_message, encode_message, Heartbeat, ReplicationMessage};
//!
//! let message = ReplicationMessage::Heartbeat(Heartbeat { term: 3, leader: 0, commit_seq: 12 });
//! let bytes = encode_message(&message).unwrap();
//! assert_eq!(decode_message(&bytes).unwrap(), message);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod messages;
mod record;

pub use envelope::{
    decode_message, encode_message, Envelope, MAX_FRAME_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AppendAck, AppendRequest, Heartbeat, HeartbeatAck, ReplicationMessage, VoteGrant,
    VoteRequest,
};
pub use record::{WireRecord, WireWrite};
