//! Room lifecycle and membership.
//!
//! The registry owns the room table. Rooms are created lazily on first join
//! and deleted as soon as the last member leaves.

use crate::clock::Clock;
use crate::room::{validate_room_name, Room, RoomId, UserId, DEFAULT_MAX_MEMBERS};
use dashmap::DashMap;
use huddle_protocol::RoomMetadata;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid room name.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// Room is at its membership cap.
    #[error("Room {room_id} is full ({max_members} members)")]
    RoomFull { room_id: String, max_members: usize },

    /// The user does not belong to the room.
    #[error("User {user_id} is not a member of room {room_id}")]
    NotAMember { room_id: String, user_id: String },
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Membership cap applied when a creating join supplies none.
    pub default_max_members: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_max_members: DEFAULT_MAX_MEMBERS,
        }
    }
}

/// Result of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    /// `false` when the user was already a member (idempotent join).
    pub newly_joined: bool,
    /// Membership snapshot, joiner included.
    pub members: Vec<UserId>,
}

/// Result of a successful leave.
#[derive(Debug)]
pub struct LeaveOutcome {
    /// Members still in the room.
    pub remaining: Vec<UserId>,
    /// Whether the room was deleted because it became empty.
    pub deleted: bool,
}

/// The room table.
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl RoomRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(RegistryConfig::default(), clock)
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            rooms: DashMap::new(),
            config,
            clock,
        }
    }

    /// Add a user to a room, creating the room lazily.
    ///
    /// The join is idempotent: an existing member gets a fresh snapshot and
    /// `newly_joined: false`. Metadata is consulted only by the creating
    /// join.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid or the room is full; a
    /// rejected join never mutates membership.
    pub fn join(
        &self,
        room_id: &str,
        user_id: &str,
        metadata: Option<RoomMetadata>,
    ) -> Result<JoinOutcome, RegistryError> {
        validate_room_name(room_id).map_err(RegistryError::InvalidRoom)?;

        let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            debug!(room = %room_id, "Creating room");
            Room::with_metadata(
                room_id,
                self.clock.now_millis(),
                metadata.unwrap_or_default(),
                self.config.default_max_members,
            )
        });

        if room.is_member(user_id) {
            return Ok(JoinOutcome {
                newly_joined: false,
                members: room.members(),
            });
        }

        if room.is_full() {
            return Err(RegistryError::RoomFull {
                room_id: room_id.to_string(),
                max_members: room.max_members(),
            });
        }

        room.add_member(user_id);
        debug!(room = %room_id, user = %user_id, members = room.member_count(), "Member joined");

        Ok(JoinOutcome {
            newly_joined: true,
            members: room.members(),
        })
    }

    /// Remove a user from a room, deleting the room if it becomes empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not a member.
    pub fn leave(&self, room_id: &str, user_id: &str) -> Result<LeaveOutcome, RegistryError> {
        let not_a_member = || RegistryError::NotAMember {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        };

        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return Err(not_a_member());
        };

        if !room.remove_member(user_id) {
            return Err(not_a_member());
        }

        let remaining = room.members();
        let deleted = room.is_empty();
        drop(room); // Release the shard before removing

        if deleted {
            self.rooms.remove(room_id);
            debug!(room = %room_id, "Deleted empty room");
        } else {
            debug!(room = %room_id, user = %user_id, remaining = remaining.len(), "Member left");
        }

        Ok(LeaveOutcome { remaining, deleted })
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Check if a user belongs to a room.
    #[must_use]
    pub fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|r| r.is_member(user_id))
            .unwrap_or(false)
    }

    /// Get a membership snapshot for a room.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<UserId> {
        self.rooms
            .get(room_id)
            .map(|r| r.members())
            .unwrap_or_default()
    }

    /// Get the member count for a room.
    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|r| r.member_count())
            .unwrap_or(0)
    }

    /// Get the number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get all room names.
    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }
}
