//! JSON text-frame codec for the Courier realtime protocol.
//!
//! One event per frame, no length prefix: the socket transport already
//! preserves message boundaries.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::{Inbound, Outbound};

/// Largest frame the codec will attempt to decode (256 KB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Actual size of the frame in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Encodes any protocol value into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

/// Decodes a JSON text frame into any protocol value.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` for oversized frames, or
/// `CodecError::Serialization` if the frame is not a valid encoding of `T`.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(frame)?)
}

/// Encodes an [`Outbound`] event for the client side of a socket.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_outbound(event: &Outbound) -> Result<String, CodecError> {
    encode(event)
}

/// Decodes an [`Inbound`] event received by the client.
///
/// Unknown event kinds decode successfully as [`Inbound::Unknown`].
///
/// # Errors
///
/// Returns [`CodecError`] for oversized or malformed frames.
pub fn decode_inbound(frame: &str) -> Result<Inbound, CodecError> {
    decode(frame)
}
