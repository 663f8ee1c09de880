//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding replication messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The bytes are not a well-formed envelope.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The peer speaks a protocol version this replica does not understand.
    #[error("protocol version {remote} not supported (accepting {min}..={max})")]
    VersionMismatch {
        /// Version stamped on the received envelope.
        remote: u16,
        /// Oldest version this replica accepts.
        min: u16,
        /// Newest version this replica accepts.
        max: u16,
    },

    /// A frame exceeds the maximum allowed size.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Maximum frame size.
        limit: usize,
    },
}
