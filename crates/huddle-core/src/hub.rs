//! Connection lifecycle and broadcast paths.
//!
//! The hub owns the connection table and wires the room registry, presence
//! subsystem, rate limiter, and staging queues together. Every way a
//! connection can end (client close, heartbeat eviction, server shutdown)
//! funnels through [`Hub::disconnect`], which keeps `Connection.rooms` and
//! `Room.members` consistent and garbage-collects the per-connection state.

use crate::clock::{system_clock, Clock};
use crate::presence::{PresenceTracker, TypingTimers};
use crate::queue::MessageQueues;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::registry::{RegistryConfig, RoomRegistry};
use crate::room::{RoomId, UserId, DEFAULT_MAX_MEMBERS};
use dashmap::DashMap;
use huddle_protocol::{code, codec, ServerEnvelope, ServerEvent};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A connection identifier, assigned at accept time.
pub type ConnectionId = String;

/// What a connection's writer task pulls off its outbound queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An encoded envelope to forward verbatim.
    Frame(Arc<str>),
    /// Close the transport with the given code and reason.
    Close { code: u16, reason: String },
}

/// Sending half of a connection's outbound queue.
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Receiving half, owned by the connection's writer task.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Connection limit reached.
    #[error("Connection limit reached ({0})")]
    AtCapacity(usize),

    /// The server is draining connections.
    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum simultaneous connections.
    pub max_connections: usize,
    /// Default room membership cap.
    pub default_max_members: usize,
    /// Per-room staging buffer capacity.
    pub queue_capacity: usize,
    /// Rate limiter settings, shared by both gates.
    pub rate_limit: RateLimitConfig,
    /// Heartbeat sweep interval.
    pub heartbeat_interval: Duration,
    /// Capabilities advertised in the handshake.
    pub capabilities: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            default_max_members: DEFAULT_MAX_MEMBERS,
            queue_capacity: crate::queue::DEFAULT_QUEUE_CAPACITY,
            rate_limit: RateLimitConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            capabilities: vec![
                "rooms".to_string(),
                "presence".to_string(),
                "typing".to_string(),
                "activity".to_string(),
                "search_sync".to_string(),
            ],
        }
    }
}

/// A registered connection.
#[derive(Debug)]
struct ConnectionEntry {
    /// Logical user; an `anon:` placeholder until the first join binds it.
    user_id: UserId,
    /// Rooms this connection has joined.
    rooms: HashSet<RoomId>,
    /// Last inbound activity, milliseconds since the Unix epoch.
    last_activity: u64,
    /// Remote address, when the transport knows it.
    remote_addr: Option<String>,
    /// Outbound queue feeding the writer task.
    sender: DeliverySender,
}

/// The connection manager.
pub struct Hub {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// `userId -> connection id` index for O(1) directed sends.
    users: DashMap<UserId, ConnectionId>,
    registry: RoomRegistry,
    presence: PresenceTracker,
    typing: TypingTimers,
    queues: MessageQueues,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    config: HubConfig,
    messages_processed: AtomicU64,
    next_connection: AtomicU64,
    shutting_down: AtomicBool,
}

impl Hub {
    /// Create a hub with the system clock.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a hub with an injected clock (deterministic tests).
    #[must_use]
    pub fn with_clock(config: HubConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            max_connections = config.max_connections,
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            "Creating hub"
        );
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            registry: RoomRegistry::with_config(
                RegistryConfig {
                    default_max_members: config.default_max_members,
                },
                clock.clone(),
            ),
            presence: PresenceTracker::new(),
            typing: TypingTimers::new(),
            queues: MessageQueues::with_capacity(config.queue_capacity),
            limiter: RateLimiter::new(config.rate_limit.clone(), clock.clone()),
            clock,
            config,
            messages_processed: AtomicU64::new(0),
            next_connection: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// The room registry.
    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// The presence tracker.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// The typing auto-stop timers.
    #[must_use]
    pub fn typing(&self) -> &TypingTimers {
        &self.typing
    }

    /// The message staging queues.
    #[must_use]
    pub fn queues(&self) -> &MessageQueues {
        &self.queues
    }

    /// The rate limiter serving both admission gates.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Current time in milliseconds.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Register a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection limit is reached or the hub is
    /// shutting down; neither case mutates any state.
    pub fn register(
        &self,
        sender: DeliverySender,
        remote_addr: Option<String>,
    ) -> Result<ConnectionId, HubError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(HubError::ShuttingDown);
        }
        if self.connections.len() >= self.config.max_connections {
            return Err(HubError::AtCapacity(self.config.max_connections));
        }

        let seq = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let connection_id = format!("conn_{seq:x}");
        let placeholder = format!("anon:{connection_id}");

        self.connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                user_id: placeholder.clone(),
                rooms: HashSet::new(),
                last_activity: self.now(),
                remote_addr,
                sender,
            },
        );
        self.users.insert(placeholder, connection_id.clone());

        debug!(connection = %connection_id, "Connection registered");
        Ok(connection_id)
    }

    /// Build the handshake frame advertising server capabilities.
    #[must_use]
    pub fn handshake(&self, connection_id: &str) -> ServerEnvelope {
        ServerEnvelope::server(
            ServerEvent::ConnectionEstablished {
                socket_id: connection_id.to_string(),
                server_time: self.now(),
                capabilities: self.config.capabilities.clone(),
            },
            self.now(),
        )
    }

    /// Refresh a connection's liveness.
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.last_activity = self.now();
        }
    }

    /// Bind a connection to its logical user id.
    ///
    /// The placeholder assigned at accept time is overwritten on the first
    /// join; rebinding keeps the `userId -> connection` index current.
    pub fn bind_user(&self, connection_id: &str, user_id: &str) {
        let previous = {
            let Some(mut entry) = self.connections.get_mut(connection_id) else {
                return;
            };
            if entry.user_id == user_id {
                None
            } else {
                Some(std::mem::replace(&mut entry.user_id, user_id.to_string()))
            }
        };

        if let Some(previous) = previous {
            self.users
                .remove_if(&previous, |_, conn| conn == connection_id);
        }
        self.users
            .insert(user_id.to_string(), connection_id.to_string());
    }

    /// Record a room in the connection's room set.
    pub fn add_room(&self, connection_id: &str, room_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.rooms.insert(room_id.to_string());
        }
    }

    /// Drop a room from the connection's room set.
    pub fn remove_room(&self, connection_id: &str, room_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.rooms.remove(room_id);
        }
    }

    /// The user a connection is bound to.
    #[must_use]
    pub fn connection_user(&self, connection_id: &str) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .map(|e| e.user_id.clone())
    }

    /// The rooms a user's connection has joined.
    #[must_use]
    pub fn user_rooms(&self, user_id: &str) -> Vec<RoomId> {
        let Some(connection_id) = self.resolve(user_id) else {
            return Vec::new();
        };
        self.connections
            .get(&connection_id)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }

    /// Count one routed message.
    pub fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Total messages routed since start.
    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Whether `shutdown` has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Send a frame to one connection.
    ///
    /// Returns `false` if the connection is gone or its writer has stopped.
    pub fn send_to_conn(&self, connection_id: &str, envelope: &ServerEnvelope) -> bool {
        let Ok(text) = codec::encode(envelope) else {
            warn!(connection = %connection_id, "Failed to encode outbound frame");
            return false;
        };
        self.send_encoded(connection_id, &Arc::from(text.as_str()))
    }

    /// Send an `error` frame to one connection.
    pub fn send_error(&self, connection_id: &str, error_code: u16, message: &str) {
        let envelope = ServerEnvelope::error(error_code, message, self.now());
        self.send_to_conn(connection_id, &envelope);
    }

    /// Send a frame to a user via the connection index.
    pub fn send_to_user(&self, user_id: &str, envelope: &ServerEnvelope) -> bool {
        match self.resolve(user_id) {
            Some(connection_id) => self.send_to_conn(&connection_id, envelope),
            None => false,
        }
    }

    /// Broadcast a frame to every member of a room.
    ///
    /// `exclude` is never delivered to, even if present in the room.
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        envelope: &ServerEnvelope,
        exclude: Option<&str>,
    ) -> usize {
        let Ok(text) = codec::encode(envelope) else {
            warn!(room = %room_id, "Failed to encode broadcast frame");
            return 0;
        };
        let frame: Arc<str> = Arc::from(text.as_str());

        let mut delivered = 0;
        for member in self.registry.members(room_id) {
            if Some(member.as_str()) == exclude {
                continue;
            }
            if let Some(connection_id) = self.resolve(&member) {
                if self.send_encoded(&connection_id, &frame) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Broadcast a frame to every connection.
    pub fn broadcast_global(&self, envelope: &ServerEnvelope, exclude: Option<&str>) -> usize {
        let Ok(text) = codec::encode(envelope) else {
            warn!("Failed to encode global broadcast frame");
            return 0;
        };
        let frame: Arc<str> = Arc::from(text.as_str());

        let mut delivered = 0;
        for entry in self.connections.iter() {
            if Some(entry.user_id.as_str()) == exclude {
                continue;
            }
            if entry.sender.send(Delivery::Frame(frame.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Connections idle longer than `max_idle_ms`.
    #[must_use]
    pub fn stale_connections(&self, max_idle_ms: u64) -> Vec<ConnectionId> {
        let now = self.now();
        self.connections
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_activity) > max_idle_ms)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Tear down a connection.
    ///
    /// Leaves every joined room (broadcasting `user_left` with `reason` to
    /// the remaining members), clears presence and typing state, and forgets
    /// the connection's rate-limit window. Safe to call for an id that is
    /// already gone.
    ///
    /// Returns `true` if the connection existed.
    pub fn disconnect(&self, connection_id: &str, reason: Option<&str>) -> bool {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return false;
        };

        self.users
            .remove_if(&entry.user_id, |_, conn| conn == connection_id);
        self.typing.disarm_user(&entry.user_id);
        self.presence.remove(&entry.user_id);
        self.limiter.forget(connection_id);

        let now = self.now();
        for room_id in &entry.rooms {
            if self.registry.leave(room_id, &entry.user_id).is_err() {
                continue;
            }
            let left = ServerEnvelope::from_user(
                ServerEvent::UserLeft {
                    room_id: room_id.clone(),
                    user_id: entry.user_id.clone(),
                    reason: reason.map(str::to_string),
                },
                entry.user_id.clone(),
                now,
            )
            .with_room(room_id.clone());
            self.broadcast_to_room(room_id, &left, None);
        }

        debug!(
            connection = %connection_id,
            user = %entry.user_id,
            remote = ?entry.remote_addr,
            "Connection removed"
        );
        true
    }

    /// Disconnect every active connection with reason "server shutdown".
    ///
    /// Idempotent: only the first call does any work. Each connection gets a
    /// close delivery (code 1001) before its state is torn down; the
    /// connection tables are empty when this returns.
    ///
    /// Returns the number of connections that were disconnected.
    pub fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        info!(connections = ids.len(), "Hub shutting down");

        for connection_id in &ids {
            let sender = self
                .connections
                .get(connection_id)
                .map(|e| e.sender.clone());
            if let Some(sender) = sender {
                let _ = sender.send(Delivery::Close {
                    code: code::CLOSE_GOING_AWAY,
                    reason: "server shutdown".to_string(),
                });
            }
            self.disconnect(connection_id, Some("server shutdown"));
        }
        ids.len()
    }

    fn resolve(&self, user_id: &str) -> Option<ConnectionId> {
        self.users.get(user_id).map(|conn| conn.value().clone())
    }

    fn send_encoded(&self, connection_id: &str, frame: &Arc<str>) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => entry.sender.send(Delivery::Frame(frame.clone())).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{connect, drain_frames, test_hub};
    use huddle_protocol::ServerEvent;

    #[tokio::test]
    async fn test_register_respects_capacity() {
        let (hub, _clock) = test_hub(|config| config.max_connections = 1);

        let (tx1, _rx1) = mpsc::unbounded_channel();
        hub.register(tx1, None).unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            hub.register(tx2, None),
            Err(HubError::AtCapacity(1))
        ));
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_user_updates_index() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_id, mut rx) = connect(&hub, "alice");

        let envelope = hub.handshake(&conn_id);
        assert!(hub.send_to_user("alice", &envelope));

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].event,
            ServerEvent::ConnectionEstablished { .. }
        ));

        // The anonymous placeholder is no longer addressable.
        assert!(!hub.send_to_user(&format!("anon:{conn_id}"), &envelope));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_user() {
        let (hub, _clock) = test_hub(|_| {});
        let (_conn_a, mut rx_a) = connect(&hub, "alice");
        let (_conn_b, mut rx_b) = connect(&hub, "bob");
        let (_conn_c, mut rx_c) = connect(&hub, "carol");

        for user in ["alice", "bob", "carol"] {
            hub.registry().join("lobby", user, None).unwrap();
        }

        let envelope = ServerEnvelope::from_user(
            ServerEvent::UserJoined {
                room_id: "lobby".into(),
                user_id: "alice".into(),
            },
            "alice",
            1,
        )
        .with_room("lobby");

        let delivered = hub.broadcast_to_room("lobby", &envelope, Some("alice"));
        assert_eq!(delivered, 2);
        assert!(drain_frames(&mut rx_a).is_empty());
        assert_eq!(drain_frames(&mut rx_b).len(), 1);
        assert_eq!(drain_frames(&mut rx_c).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_everything() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, _rx_a) = connect(&hub, "alice");
        let (_conn_b, mut rx_b) = connect(&hub, "bob");

        hub.registry().join("lobby", "alice", None).unwrap();
        hub.add_room(&conn_a, "lobby");
        hub.registry().join("lobby", "bob", None).unwrap();
        hub.limiter().check_and_consume(&conn_a);
        hub.presence().set("alice", "online", 1);

        assert!(hub.disconnect(&conn_a, None));
        assert!(!hub.disconnect(&conn_a, None));

        assert_eq!(hub.connection_count(), 1);
        assert!(!hub.registry().is_member("lobby", "alice"));
        assert!(hub.presence().get("alice").is_none());
        assert_eq!(hub.limiter().tracked(), 0);
        assert!(hub.connection_user(&conn_a).is_none());

        let frames = drain_frames(&mut rx_b);
        assert_eq!(frames.len(), 1);
        match &frames[0].event {
            ServerEvent::UserLeft {
                user_id, reason, ..
            } => {
                assert_eq!(user_id, "alice");
                assert!(reason.is_none());
            }
            other => panic!("Expected user_left, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_all() {
        let (hub, _clock) = test_hub(|_| {});
        let (_conn_a, mut rx_a) = connect(&hub, "alice");
        let (_conn_b, mut rx_b) = connect(&hub, "bob");

        assert_eq!(hub.shutdown(), 2);
        assert_eq!(hub.shutdown(), 0);
        assert_eq!(hub.connection_count(), 0);

        for rx in [&mut rx_a, &mut rx_b] {
            let mut saw_close = false;
            while let Ok(delivery) = rx.try_recv() {
                if let Delivery::Close { code: c, reason } = delivery {
                    assert_eq!(c, code::CLOSE_GOING_AWAY);
                    assert_eq!(reason, "server shutdown");
                    saw_close = true;
                }
            }
            assert!(saw_close);
        }

        // New registrations are refused while shut down.
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            hub.register(tx, None),
            Err(HubError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_stale_connections_tracks_idle_time() {
        let (hub, clock) = test_hub(|_| {});
        let (conn_a, _rx_a) = connect(&hub, "alice");
        let (_conn_b, _rx_b) = connect(&hub, "bob");

        clock.advance(5_000);
        hub.touch(&conn_a);
        clock.advance(3_000);

        let stale = hub.stale_connections(4_000);
        assert_eq!(stale.len(), 1);
        assert_ne!(stale[0], conn_a);
    }
}
