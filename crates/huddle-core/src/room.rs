//! Room abstraction for Huddle.
//!
//! Rooms are named groups of users that receive broadcasts together.

use huddle_protocol::RoomMetadata;
use std::collections::HashSet;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Default membership cap.
pub const DEFAULT_MAX_MEMBERS: usize = 100;

/// A room identifier.
pub type RoomId = String;

/// A logical user identifier.
pub type UserId = String;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    // Check for valid ASCII printable characters
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// A capacity-bounded membership record.
///
/// Rooms are created lazily on first join and deleted the moment their
/// membership reaches zero; a later join recreates them fresh.
#[derive(Debug)]
pub struct Room {
    /// Room name.
    name: RoomId,
    /// Current members.
    members: HashSet<UserId>,
    /// Membership cap.
    max_members: usize,
    /// Creation time, milliseconds since the Unix epoch.
    created_at: u64,
    /// Client-supplied attributes from the creating join.
    metadata: RoomMetadata,
}

impl Room {
    /// Create a new room with the default membership cap.
    #[must_use]
    pub fn new(name: impl Into<RoomId>, created_at: u64) -> Self {
        Self::with_metadata(name, created_at, RoomMetadata::default(), DEFAULT_MAX_MEMBERS)
    }

    /// Create a new room, honoring a `max_members` override from metadata.
    #[must_use]
    pub fn with_metadata(
        name: impl Into<RoomId>,
        created_at: u64,
        metadata: RoomMetadata,
        default_max_members: usize,
    ) -> Self {
        // A cap of zero would leave a permanently empty room in the table.
        let max_members = metadata.max_members.unwrap_or(default_max_members).max(1);
        Self {
            name: name.into(),
            members: HashSet::new(),
            max_members,
            created_at,
            metadata,
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rooms created lazily on join are plain group rooms.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        "group"
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a user is a member.
    #[must_use]
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if the room is at its membership cap.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_members
    }

    /// Get the membership cap.
    #[must_use]
    pub fn max_members(&self) -> usize {
        self.max_members
    }

    /// Get the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Get the room metadata.
    #[must_use]
    pub fn metadata(&self) -> &RoomMetadata {
        &self.metadata
    }

    /// Add a member.
    ///
    /// Returns `true` if the user was not already a member.
    pub fn add_member(&mut self, user_id: impl Into<UserId>) -> bool {
        self.members.insert(user_id.into())
    }

    /// Remove a member.
    ///
    /// Returns `true` if the user was a member.
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        self.members.remove(user_id)
    }

    /// Get all member ids.
    #[must_use]
    pub fn members(&self) -> Vec<UserId> {
        self.members.iter().cloned().collect()
    }
}
