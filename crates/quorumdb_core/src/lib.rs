//! # QuorumDB Core
//!
//! Replicated transactional keyed-state engine.
//!
//! This crate provides:
//! - a durable, totally ordered log with commit and vote markers
//! - in-memory collections rebuilt from the log
//! - optimistic transactions with `compute_and_set`, validated at commit
//! - leader-based replication that commits a record once a quorum holds it
//!
//! ## Example
//!
//! ```rust
//! use quorumdb_core::{CancellationToken, Replica};
//! use std::time::Duration;
//!
//! let replica = Replica::open_in_memory().unwrap();
//! let counters = replica.collection("counters").unwrap();
//!
//! let hits = replica
//!     .run(|tx| {
//!         replica.compute_and_set(
//!             tx,
//!             &counters,
//!             b"hits",
//!             |_, current| Ok(vec![current.map_or(0, |v| v[0]) + 1]),
//!             Duration::from_secs(1),
//!             &CancellationToken::new(),
//!         )
//!     })
//!     .unwrap();
//! assert_eq!(hits, vec![1]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dir;
mod error;
mod replica;
mod stats;
mod typed;
mod types;

pub mod log;
pub mod replication;
pub mod store;
pub mod transaction;

pub use config::{ClusterConfig, Config};
pub use dir::ReplicaDir;
pub use error::{CoreError, CoreResult};
pub use replica::Replica;
pub use replication::{
    LoopbackNetwork, MessageHandler, ReplicaServer, ReplicaTransport, ReplicationCoordinator,
    Role, TcpTransport,
};
pub use stats::{EngineStats, StatsSnapshot};
pub use store::{CollectionHandle, CollectionStore, SnapshotRow, VersionedValue};
pub use transaction::{
    CancellationToken, RetryPolicy, Transaction, TransactionManager, TransactionState,
};
pub use typed::TypedCollection;
pub use types::{CommitSeq, ReplicaId, Term, TransactionId, Version};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
