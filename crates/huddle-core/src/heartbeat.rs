//! Periodic liveness sweep.
//!
//! A connection that has shown no activity for two heartbeat intervals is
//! presumed dead and evicted. The evicted peer gets no direct notice (its
//! transport is already unreachable); its former room peers receive
//! `user_left` with reason "inactive connection".

use crate::hub::{ConnectionId, Hub};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Eviction reason attached to `user_left` broadcasts.
pub const EVICTION_REASON: &str = "inactive connection";

/// Idle cutoff: two missed heartbeat intervals.
#[must_use]
pub fn max_idle_ms(hub: &Hub) -> u64 {
    hub.config().heartbeat_interval.as_millis() as u64 * 2
}

/// Run the sweep loop until aborted.
pub fn spawn(hub: Arc<Hub>) -> JoinHandle<()> {
    let interval = hub.config().heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            let evicted = sweep(&hub);
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Evicted stale connections");
            }
        }
    })
}

/// Evict every connection idle longer than the cutoff.
///
/// Returns the evicted connection ids.
pub fn sweep(hub: &Hub) -> Vec<ConnectionId> {
    let stale = hub.stale_connections(max_idle_ms(hub));
    for connection_id in &stale {
        debug!(connection = %connection_id, "Evicting inactive connection");
        hub.disconnect(connection_id, Some(EVICTION_REASON));
    }
    stale
}
