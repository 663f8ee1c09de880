//! Error types for QuorumDB core.

use crate::types::ReplicaId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in QuorumDB core operations.
///
/// The first six variants are the engine's caller-facing taxonomy. The rest
/// report infrastructure failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A write was attempted on a replica that is not the Primary.
    #[error("not primary (leader: {leader:?})")]
    NotPrimary {
        /// Known Primary, if any, for the caller to redirect to.
        leader: Option<ReplicaId>,
    },

    /// An optimistic-concurrency check failed; restart the transaction.
    #[error("conflict on key {key:?} in collection {collection}")]
    Conflict {
        /// Collection of the invalidated read.
        collection: String,
        /// Key of the invalidated read.
        key: Vec<u8>,
    },

    /// A bounded compute or replication step did not finish in time.
    #[error("{operation} timed out")]
    Timeout {
        /// The step that timed out.
        operation: String,
    },

    /// The caller cancelled an in-flight step.
    #[error("operation cancelled")]
    Cancelled,

    /// Replication quorum or durable storage cannot be reached.
    #[error("unavailable: {reason}")]
    Unavailable {
        /// Why the engine could not make progress.
        reason: String,
    },

    /// Operation on a terminal transaction, or an out-of-order apply.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the violated state.
        message: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] quorumdb_storage::StorageError),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] quorumdb_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the replica's data directory.
    #[error("data directory locked: {}", path.display())]
    DataDirLocked {
        /// The locked directory.
        path: PathBuf,
    },

    /// The log is corrupted or invalid.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// An argument was rejected.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// A typed value could not be encoded or decoded.
    #[error("encoding error: {message}")]
    Encoding {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a not-primary error.
    pub fn not_primary(leader: Option<ReplicaId>) -> Self {
        Self::NotPrimary { leader }
    }

    /// Creates a conflict error.
    pub fn conflict(collection: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self::Conflict {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Returns true if restarting the transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Timeout { .. } | Self::Unavailable { .. }
        )
    }
}
