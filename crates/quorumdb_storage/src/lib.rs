//! # QuorumDB Storage
//!
//! Byte-level storage backends underneath the QuorumDB replicated log.
//!
//! Backends are **opaque append-only byte stores**. They know nothing about
//! log envelopes, sequence numbers or terms; `quorumdb_core` owns the format.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - shared in-memory bytes with write-failure injection
//! - [`FileBackend`] - persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use quorumdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"record").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
