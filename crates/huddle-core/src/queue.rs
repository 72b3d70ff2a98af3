//! Bounded per-room message staging.
//!
//! The hub does not persist messages. Each room has a bounded FIFO buffer
//! that stages chat messages for an external persistence collaborator;
//! appending beyond capacity drops the oldest entry, and everything is lost
//! on restart.

use crate::room::RoomId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Default per-room buffer capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A chat message staged for persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedMessage {
    pub room_id: RoomId,
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub timestamp: u64,
}

/// Per-room bounded FIFO staging buffers.
pub struct MessageQueues {
    queues: DashMap<RoomId, VecDeque<StagedMessage>>,
    capacity: usize,
}

impl MessageQueues {
    /// Create queues with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create queues with a specific per-room capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a message to its room's buffer.
    ///
    /// Returns `true` if an older entry was dropped to make space.
    pub fn push(&self, message: StagedMessage) -> bool {
        let mut queue = self.queues.entry(message.room_id.clone()).or_default();

        let evicted = queue.len() >= self.capacity;
        if evicted {
            queue.pop_front();
            trace!(room = %message.room_id, "Staging buffer full, dropped oldest");
        }
        queue.push_back(message);
        evicted
    }

    /// Number of staged messages for a room.
    #[must_use]
    pub fn len(&self, room_id: &str) -> usize {
        self.queues.get(room_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Whether a room has nothing staged.
    #[must_use]
    pub fn is_empty(&self, room_id: &str) -> bool {
        self.len(room_id) == 0
    }

    /// Take every staged message for a room, oldest first.
    #[must_use]
    pub fn drain(&self, room_id: &str) -> Vec<StagedMessage> {
        self.queues
            .remove(room_id)
            .map(|(_, queue)| queue.into())
            .unwrap_or_default()
    }

    /// Take every staged message across all rooms.
    #[must_use]
    pub fn drain_all(&self) -> Vec<StagedMessage> {
        let rooms: Vec<RoomId> = self.queues.iter().map(|q| q.key().clone()).collect();
        rooms.iter().flat_map(|room| self.drain(room)).collect()
    }

    /// Per-room capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink failure.
#[derive(Debug, Error)]
#[error("Persistence sink error: {0}")]
pub struct SinkError(pub String);

/// Destination for drained messages.
///
/// Implemented by the external persistence collaborator; the hub only
/// stages.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Persist a drained batch.
    async fn persist(&self, batch: Vec<StagedMessage>) -> Result<(), SinkError>;
}

/// Periodically drain every room buffer into the sink.
///
/// Runs detached from the dispatch path, so a slow sink cannot stall
/// message handling. A failed batch is dropped with a warning; the buffers
/// offer no durability to fall back on.
pub fn spawn_drain(
    queues: Arc<MessageQueues>,
    sink: Arc<dyn PersistenceSink>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let batch = queues.drain_all();
            if batch.is_empty() {
                continue;
            }
            let count = batch.len();
            if let Err(e) = sink.persist(batch).await {
                warn!(error = %e, dropped = count, "Persistence sink rejected batch");
            }
        }
    })
}
