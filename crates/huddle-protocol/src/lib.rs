//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle realtime messaging hub.
//!
//! This crate defines the JSON envelope exchanged between Huddle clients and
//! servers, the typed event unions it wraps, and the codec that validates
//! inbound frames.
//!
//! ## Envelope shape
//!
//! ```json
//! {"type": "message", "payload": {"roomId": "lobby", "content": "hi"},
//!  "timestamp": 1700000000000, "userId": "alice", "roomId": "lobby"}
//! ```
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent};
//!
//! let raw = r#"{"type":"leave_room","payload":{"roomId":"lobby"},
//!               "timestamp":1,"userId":"alice"}"#;
//! let envelope = codec::decode(raw).unwrap();
//! assert!(matches!(envelope.event, ClientEvent::LeaveRoom { .. }));
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{
    code, Audience, ClientEnvelope, ClientEvent, Envelope, RoomMetadata, ServerEnvelope,
    ServerEvent, SYSTEM_USER,
};
