//! # QuorumDB Testkit
//!
//! Test utilities for QuorumDB.
//!
//! This crate provides:
//! - Single-replica fixtures with automatic cleanup
//! - In-process clusters whose members can crash, restart and be partitioned
//! - Property-based workload generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quorumdb_testkit::prelude::*;
//!
//! #[test]
//! fn failover() {
//!     let mut cluster = TestCluster::with_primary(3);
//!     put(cluster.replica(0), "things", b"k", b"v").unwrap();
//!     cluster.crash(0);
//!     assert!(cluster.elect(1));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
