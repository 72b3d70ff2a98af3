//! Envelope and event types for the Huddle protocol.
//!
//! Every frame crossing the wire, in either direction, is an [`Envelope`]:
//! a tagged event (`type` + `payload`) plus sender metadata (`timestamp`,
//! `userId`, optional `roomId`). Payloads are validated once, at the codec
//! boundary; an unrecognized `type` or malformed payload never reaches the
//! router.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User id attached to server-originated envelopes.
pub const SYSTEM_USER: &str = "system";

/// Frame and close codes.
pub mod code {
    /// Malformed or unrecognized envelope.
    pub const ERR_PROTOCOL: u16 = 1002;
    /// Operation referenced a room the sender does not belong to.
    pub const ERR_ROUTING: u16 = 1003;
    /// Per-message rate limit exceeded.
    pub const ERR_RATE_LIMITED: u16 = 1008;
    /// Room or connection capacity reached.
    pub const ERR_CAPACITY: u16 = 1013;

    /// Close code sent when the server shuts down.
    pub const CLOSE_GOING_AWAY: u16 = 1001;
    /// Close code for connect-time rate-limit rejection.
    pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
    /// Close code for connect-time capacity rejection.
    pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
}

/// Room attributes a client may supply on first join.
///
/// Only consulted when the join lazily creates the room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether the room should be hidden from listings.
    #[serde(default)]
    pub private: bool,
    /// Membership cap override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_members: Option<usize>,
}

/// Who an activity event is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Members of the event's room.
    Room,
    /// Every connected client.
    Global,
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Join a room, creating it lazily.
    JoinRoom {
        room_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<RoomMetadata>,
    },

    /// Leave a room.
    LeaveRoom { room_id: String },

    /// Send a chat message to a room.
    Message {
        room_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_type: Option<String>,
    },

    /// Update presence status, optionally scoped to one room.
    Presence {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Start or stop a typing indicator.
    Typing { room_id: String, is_typing: bool },

    /// Share a search result summary with a room.
    SearchSync {
        query: String,
        results: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Generic activity event, fanned out per `audience`.
    Activity {
        activity_type: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audience: Option<Audience>,
    },
}

impl ClientEvent {
    /// Wire name of the event type.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::LeaveRoom { .. } => "leave_room",
            ClientEvent::Message { .. } => "message",
            ClientEvent::Presence { .. } => "presence",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::SearchSync { .. } => "search_sync",
            ClientEvent::Activity { .. } => "activity",
        }
    }
}

/// Events the server broadcasts or replies with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Handshake sent once per connection, immediately after accept.
    ConnectionEstablished {
        socket_id: String,
        server_time: u64,
        capabilities: Vec<String>,
    },

    /// Join acknowledgment for the joiner, with a membership snapshot.
    RoomJoined { room_id: String, members: Vec<String> },

    /// Leave acknowledgment for the leaver.
    RoomLeft { room_id: String },

    /// A peer joined the room.
    UserJoined { room_id: String, user_id: String },

    /// A peer left the room, explicitly or by eviction.
    UserLeft {
        room_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Chat message echoed to every room member, sender included.
    Message {
        room_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_type: Option<String>,
    },

    /// Presence status change.
    PresenceUpdate { user_id: String, status: String },

    /// Typing indicator, never echoed to its sender.
    TypingIndicator {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },

    /// Result-count summary of a peer's search.
    SearchSync {
        room_id: String,
        query: String,
        result_count: usize,
    },

    /// Generic activity fan-out.
    Activity {
        activity_type: String,
        data: Value,
        audience: Audience,
    },

    /// Rejection of a single inbound frame; the connection stays open.
    Error { code: u16, message: String },
}

impl ServerEvent {
    /// Wire name of the event type.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionEstablished { .. } => "connection_established",
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::RoomLeft { .. } => "room_left",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::Message { .. } => "message",
            ServerEvent::PresenceUpdate { .. } => "presence_update",
            ServerEvent::TypingIndicator { .. } => "typing_indicator",
            ServerEvent::SearchSync { .. } => "search_sync",
            ServerEvent::Activity { .. } => "activity",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// The uniform message wrapper exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<E> {
    /// The typed event (`type` + `payload` on the wire).
    #[serde(flatten)]
    pub event: E,
    /// Sender-supplied creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Logical sender; [`SYSTEM_USER`] for server-originated frames.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Room the event concerns, when any.
    #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// An inbound client envelope.
pub type ClientEnvelope = Envelope<ClientEvent>;

/// An outbound server envelope.
pub type ServerEnvelope = Envelope<ServerEvent>;

impl Envelope<ServerEvent> {
    /// Create a server-originated envelope.
    #[must_use]
    pub fn server(event: ServerEvent, timestamp: u64) -> Self {
        Self {
            event,
            timestamp,
            user_id: SYSTEM_USER.to_string(),
            room_id: None,
        }
    }

    /// Create an envelope attributed to a user (broadcast relays).
    #[must_use]
    pub fn from_user(event: ServerEvent, user_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            event,
            timestamp,
            user_id: user_id.into(),
            room_id: None,
        }
    }

    /// Attach a room id.
    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Create an error envelope.
    #[must_use]
    pub fn error(error_code: u16, message: impl Into<String>, timestamp: u64) -> Self {
        Self::server(
            ServerEvent::Error {
                code: error_code,
                message: message.into(),
            },
            timestamp,
        )
    }
}
