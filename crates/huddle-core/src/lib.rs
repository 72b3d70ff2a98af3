//! # huddle-core
//!
//! Connection hub, room registry, and message routing for the Huddle
//! realtime messaging engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Connection lifecycle, user index, and broadcast paths
//! - **Registry** - Room lifecycle and capacity-bounded membership
//! - **Router** - Typed dispatch of inbound envelopes
//! - **Presence** - Ephemeral statuses and typing auto-stop timers
//! - **RateLimiter** - Sliding-window admission control
//! - **Heartbeat** - Liveness sweep evicting stale connections
//! - **MessageQueues** - Bounded staging for a persistence sink
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                ┌───────────┼───────────┐
//!                ▼           ▼           ▼
//!         ┌──────────┐ ┌──────────┐ ┌──────────┐
//!         │ Presence │ │  Queues  │ │   Hub    │──▶ broadcasts
//!         └──────────┘ └──────────┘ └──────────┘
//! ```

pub mod clock;
pub mod heartbeat;
pub mod hub;
pub mod presence;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod room;
pub mod router;

#[cfg(test)]
mod test_util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use hub::{ConnectionId, Delivery, DeliveryReceiver, DeliverySender, Hub, HubConfig, HubError};
pub use presence::{PresenceTracker, TypingTimers, TYPING_TTL};
pub use queue::{MessageQueues, PersistenceSink, StagedMessage};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::{RegistryError, RoomRegistry};
pub use room::{Room, RoomId, UserId};
pub use router::{dispatch, RouteError};
