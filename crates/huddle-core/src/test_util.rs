//! Shared fixtures for hub-level tests.

use crate::clock::ManualClock;
use crate::hub::{ConnectionId, Delivery, DeliveryReceiver, Hub, HubConfig};
use huddle_protocol::{ClientEnvelope, ClientEvent, ServerEnvelope};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Build a hub on a manual clock, letting the test tweak the config.
pub(crate) fn test_hub(
    configure: impl FnOnce(&mut HubConfig),
) -> (Arc<Hub>, Arc<ManualClock>) {
    let mut config = HubConfig::default();
    configure(&mut config);
    let clock = Arc::new(ManualClock::new(1_000));
    (Arc::new(Hub::with_clock(config, clock.clone())), clock)
}

/// Register a connection and bind it to a user.
pub(crate) fn connect(hub: &Arc<Hub>, user_id: &str) -> (ConnectionId, DeliveryReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection_id = hub.register(tx, Some("127.0.0.1:9999".to_string())).unwrap();
    hub.bind_user(&connection_id, user_id);
    (connection_id, rx)
}

/// Build an inbound envelope the way a client would.
pub(crate) fn client(event: ClientEvent, user_id: &str) -> ClientEnvelope {
    ClientEnvelope {
        event,
        timestamp: 1_700_000_000_000,
        user_id: user_id.to_string(),
        room_id: None,
    }
}

/// Pull every queued frame off a connection, decoding the envelopes.
///
/// Close deliveries are skipped; use the receiver directly to assert on
/// them.
pub(crate) fn drain_frames(rx: &mut DeliveryReceiver) -> Vec<ServerEnvelope> {
    let mut frames = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        if let Delivery::Frame(text) = delivery {
            frames.push(serde_json::from_str(&text).expect("valid server envelope"));
        }
    }
    frames
}
