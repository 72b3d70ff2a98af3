//! Codec for encoding and decoding Huddle envelopes.
//!
//! Frames are JSON text, one envelope per WebSocket message. Inbound data is
//! size-checked and validated against the envelope schema here, before any
//! state is touched.

use serde::Serialize;
use thiserror::Error;

use crate::envelope::{ClientEnvelope, Envelope};

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// The frame is not a valid envelope: bad JSON, unknown `type`, or a
    /// payload that does not match the declared schema.
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode an envelope as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<E: Serialize>(envelope: &Envelope<E>) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode and validate an inbound client envelope.
///
/// # Errors
///
/// Returns an error if the frame is oversized or is not a recognized
/// envelope.
pub fn decode(data: &str) -> Result<ClientEnvelope, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    Ok(serde_json::from_str(data)?)
}
