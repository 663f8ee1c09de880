//! Versioned envelope and CBOR encoding.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::ReplicationMessage;
use serde::{Deserialize, Serialize};

/// Protocol version written by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Oldest protocol version this build still accepts.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Upper bound for an encoded envelope on the wire (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A message stamped with the sender's protocol version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender's protocol version.
    pub version: u16,
    /// The message.
    pub message: ReplicationMessage,
}

/// Envelope whose message is decoded only after the version check, so a newer
/// peer's unknown variants surface as `VersionMismatch` rather than a decode error.
#[derive(Deserialize)]
struct RawEnvelope {
    version: u16,
    message: ciborium::Value,
}

impl Envelope {
    /// Wraps a message with the current protocol version.
    #[must_use]
    pub fn new(message: ReplicationMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Encodes the envelope as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the result exceeds
    /// [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Decodes an envelope, rejecting unsupported protocol versions.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::VersionMismatch`] for versions outside
    /// [`MIN_PROTOCOL_VERSION`]..=[`PROTOCOL_VERSION`], or a decode error for
    /// malformed bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_SIZE,
            });
        }

        let raw: RawEnvelope =
            ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&raw.version) {
            return Err(ProtocolError::VersionMismatch {
                remote: raw.version,
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            });
        }

        let message = raw
            .message
            .deserialized()
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(Self {
            version: raw.version,
            message,
        })
    }
}

/// Encodes a message in a current-version envelope.
///
/// # Errors
///
/// See [`Envelope::encode`].
pub fn encode_message(message: &ReplicationMessage) -> ProtocolResult<Vec<u8>> {
    Envelope::new(message.clone()).encode()
}

/// Decodes an envelope and returns its message.
///
/// # Errors
///
/// See [`Envelope::decode`].
pub fn decode_message(bytes: &[u8]) -> ProtocolResult<ReplicationMessage> {
    Envelope::decode(bytes).map(|envelope| envelope.message)
}
