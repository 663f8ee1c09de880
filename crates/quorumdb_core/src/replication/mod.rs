//! Leader-based replication of the log across a fixed replica set.
//!
//! One Primary per term appends records and ships them to Secondaries. A
//! record commits once a majority holds it; only then is it applied.
//!
//! ## Election
//!
//! - a replica that hears nothing for its election timeout starts a new term
//!   and asks for votes
//! - each replica grants at most one vote per term, and only to a candidate
//!   whose log is at least as up to date as its own
//! - a candidate with a majority of votes becomes Primary and appends a term
//!   barrier; it refuses writes until the barrier commits
//!
//! ## Log Matching
//!
//! Every append names the sequence and term just before its records. A
//! Secondary that disagrees rejects the append, and the Primary walks back
//! until the logs match. Conflicting unconfirmed records are truncated.

mod coordinator;
mod pending;
mod progress;
mod role;
mod tcp;
mod transport;

pub use coordinator::ReplicationCoordinator;
pub use pending::PendingRecords;
pub use progress::quorum_seq;
pub use role::Role;
pub use tcp::{read_frame, write_frame, ReplicaServer, TcpTransport};
pub use transport::{LoopbackNetwork, MessageHandler, ReplicaTransport};
