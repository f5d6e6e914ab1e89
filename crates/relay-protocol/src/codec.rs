//! Codec for encoding and decoding Relay frames.
//!
//! All frames are JSON text. Decoding is strict about shape: the payload must
//! be a JSON object and every known key must carry the expected type.

use serde_json::Value;
use thiserror::Error;

use crate::frames::{ControlFrame, ServerFrame};

/// Default maximum control frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON with the wrong shape.
    #[error("Invalid frame: {0}")]
    Invalid(&'static str),
}

/// Decode a client control frame with the default size limit.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object of the expected shape.
pub fn decode_control(text: &str) -> Result<ControlFrame, ProtocolError> {
    decode_control_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode a client control frame, rejecting frames larger than `max_size`.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a JSON object of the
/// expected shape.
pub fn decode_control_with_limit(text: &str, max_size: usize) -> Result<ControlFrame, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::Invalid("control frame must be a JSON object"));
    }

    Ok(serde_json::from_value(value)?)
}

/// Encode a control frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_control(frame: &ControlFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Encode a server frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server(frame: &ServerFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Check whether a text payload is a `{"pong":true}` frame.
#[must_use]
pub fn is_pong(text: &str) -> bool {
    // Cheap pre-check so ordinary data frames skip the JSON parse.
    if !text.contains("pong") {
        return false;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map.get("pong") == Some(&Value::Bool(true)),
        _ => false,
    }
}
