//! Sliding-window admission control.
//!
//! One limiter instance serves both gates: connect attempts keyed by remote
//! address and application messages keyed by connection id. The limiter
//! fails closed: once a window is exhausted, every further call inside it is
//! rejected.

use crate::clock::Clock;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Calls allowed per window.
    pub max_messages: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_messages: 100,
        }
    }
}

/// A counting window. `count == 0` marks a slot that has never been used.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: u64,
}

/// Per-identifier sliding-window rate limiter.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            clock,
        }
    }

    /// Count one call against the identifier's window.
    ///
    /// An absent or expired window (`now > reset_at`) is restarted with
    /// `count = 1` and the call is allowed. Otherwise the count is
    /// incremented and the call is allowed iff it stays within
    /// `max_messages`.
    pub fn check_and_consume(&self, identifier: &str) -> bool {
        let now = self.clock.now_millis();
        let mut window = self
            .windows
            .entry(identifier.to_string())
            .or_insert(Window {
                count: 0,
                reset_at: 0,
            });

        if window.count == 0 || now > window.reset_at {
            *window = Window {
                count: 1,
                reset_at: now + self.config.window_ms,
            };
            trace!(identifier = %identifier, "Rate limit window started");
            return true;
        }

        window.count += 1;
        window.count <= self.config.max_messages
    }

    /// Drop the window for an identifier (connection teardown).
    pub fn forget(&self, identifier: &str) {
        self.windows.remove(identifier);
    }

    /// Number of identifiers currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
