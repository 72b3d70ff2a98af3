//! Ephemeral presence and typing state.
//!
//! Presence is never persisted: it lives exactly as long as the broadcasts
//! it triggers. Typing indicators additionally carry a scheduled auto-stop.

use crate::room::{RoomId, UserId};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long a typing indicator stays up without a follow-up start.
pub const TYPING_TTL: Duration = Duration::from_secs(5);

/// A user's current status.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceState {
    /// Free-form status string ("online", "away", ...).
    pub status: String,
    /// When the status was last set, milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// Per-user presence statuses.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    statuses: DashMap<UserId, PresenceState>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user's status.
    pub fn set(&self, user_id: impl Into<UserId>, status: impl Into<String>, now: u64) {
        let user_id = user_id.into();
        self.statuses.insert(
            user_id.clone(),
            PresenceState {
                status: status.into(),
                updated_at: now,
            },
        );
        debug!(user = %user_id, "Presence updated");
    }

    /// Get a user's status.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceState> {
        self.statuses.get(user_id).map(|s| s.clone())
    }

    /// Drop a user's status (disconnect).
    pub fn remove(&self, user_id: &str) {
        self.statuses.remove(user_id);
    }

    /// Number of users with a known status.
    #[must_use]
    pub fn count(&self) -> usize {
        self.statuses.len()
    }
}

/// Pending typing auto-stop tasks, keyed by user and room.
///
/// A new typing start replaces and cancels the pending stop for the same
/// key, so the indicator cannot flicker off while the user keeps typing.
#[derive(Debug, Default)]
pub struct TypingTimers {
    pending: DashMap<(UserId, RoomId), JoinHandle<()>>,
}

impl TypingTimers {
    /// Create an empty timer table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an auto-stop task, canceling any pending one for the key.
    pub fn arm(&self, user_id: impl Into<UserId>, room_id: impl Into<RoomId>, task: JoinHandle<()>) {
        if let Some(previous) = self.pending.insert((user_id.into(), room_id.into()), task) {
            previous.abort();
        }
    }

    /// Cancel the pending auto-stop for a key (explicit typing stop).
    pub fn disarm(&self, user_id: &str, room_id: &str) {
        if let Some((_, task)) = self
            .pending
            .remove(&(user_id.to_string(), room_id.to_string()))
        {
            task.abort();
        }
    }

    /// Forget a key whose task ran to completion.
    pub fn complete(&self, user_id: &str, room_id: &str) {
        self.pending
            .remove(&(user_id.to_string(), room_id.to_string()));
    }

    /// Cancel every pending auto-stop for a user (disconnect).
    pub fn disarm_user(&self, user_id: &str) {
        let keys: Vec<_> = self
            .pending
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some((_, task)) = self.pending.remove(&key) {
                task.abort();
            }
        }
    }

    /// Number of pending auto-stop tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
