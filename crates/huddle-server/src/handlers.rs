//! Connection handlers for the Huddle server.
//!
//! This module handles the connection lifecycle: the connect-time admission
//! gates, the handshake, the per-connection read loop and writer task, and
//! the health endpoint.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use huddle_core::{heartbeat, router, Delivery, Hub};
use huddle_protocol::{code, codec};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The connection hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    /// When the server started.
    pub started_at: Instant,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.hub_config())),
            config,
            started_at: Instant::now(),
        }
    }
}

/// Run the server until interrupted (ctrl-c).
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(config: Config) -> Result<()> {
    run_until(config, shutdown_signal()).await
}

/// Run the server until `signal` resolves, then drain and stop.
///
/// Every active connection is closed with reason "server shutdown"; this
/// returns only after the connection tasks have finished.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound — the one condition
/// fatal to the whole server.
pub async fn run_until(
    config: Config,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind listener on {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let sweeper = heartbeat::spawn(state.hub.clone());

    let hub = state.hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.await;
        info!("Shutdown requested, draining connections");
        // Closing the connections ends their tasks; serve returns once
        // they have drained.
        hub.shutdown();
    })
    .await?;

    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.hub.connection_count();
    axum::Json(serde_json::json!({
        "status": health_status(connected, state.config.limits.max_connections),
        "details": {
            "connectedUsers": connected,
            "activeRooms": state.hub.room_count(),
            "messagesProcessed": state.hub.messages_processed(),
            "uptime": state.started_at.elapsed().as_secs(),
        }
    }))
}

fn health_status(connected: usize, max_connections: usize) -> &'static str {
    if connected > max_connections {
        "unhealthy"
    } else if connected * 10 > max_connections * 9 {
        "degraded"
    } else {
        "healthy"
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(mut socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    // Connect-time gate, keyed by remote address. Rejection closes the
    // transport with a policy-violation code and touches no other state.
    if !state.hub.limiter().check_and_consume(&addr.ip().to_string()) {
        warn!(remote = %addr, "Connection rate limit exceeded");
        metrics::record_error("connect_rate_limit");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: code::CLOSE_POLICY_VIOLATION,
                reason: "connection rate limit exceeded".into(),
            })))
            .await;
        return;
    }

    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
    let connection_id = match state.hub.register(delivery_tx, Some(addr.to_string())) {
        Ok(id) => id,
        Err(e) => {
            warn!(remote = %addr, error = %e, "Connection rejected");
            metrics::record_error("connect_capacity");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: code::CLOSE_TRY_AGAIN_LATER,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(connection = %connection_id, remote = %addr, "WebSocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Handshake advertising server capabilities.
    let handshake = state.hub.handshake(&connection_id);
    let sent = match codec::encode(&handshake) {
        Ok(text) => ws_tx.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    };
    if !sent {
        error!(connection = %connection_id, "Failed to send handshake");
        state.hub.disconnect(&connection_id, None);
        return;
    }

    // Writer task: forwards queued deliveries to the socket so a slow
    // client never blocks dispatch.
    let writer = tokio::spawn(async move {
        while let Some(delivery) = delivery_rx.recv().await {
            match delivery {
                Delivery::Frame(text) => {
                    metrics::record_message(text.len(), "outbound");
                    if ws_tx.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Delivery::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Read loop: frames from one connection are handled strictly in
    // receipt order.
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&state, &connection_id, &text),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => handle_frame(&state, &connection_id, text),
                Err(_) => {
                    metrics::record_error("protocol");
                    state.hub.send_error(
                        &connection_id,
                        code::ERR_PROTOCOL,
                        "frames must be UTF-8 JSON",
                    );
                }
            },
            // Keepalive traffic refreshes liveness in both directions.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => state.hub.touch(&connection_id),
            Ok(Message::Close(_)) => {
                debug!(connection = %connection_id, "Received close frame");
                break;
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    state.hub.disconnect(&connection_id, None);
    metrics::set_active_rooms(state.hub.room_count());
    let _ = writer.await;
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle one inbound text frame.
fn handle_frame(state: &Arc<AppState>, connection_id: &str, text: &str) {
    if text.len() > state.config.limits.max_message_size {
        metrics::record_error("oversized");
        state
            .hub
            .send_error(connection_id, code::ERR_PROTOCOL, "message too large");
        return;
    }

    let start = Instant::now();
    match codec::decode(text) {
        Ok(envelope) => {
            metrics::record_message(text.len(), "inbound");
            router::dispatch(&state.hub, connection_id, envelope);
            metrics::set_active_rooms(state.hub.room_count());
        }
        Err(e) => {
            // A bad frame answers its sender only; nothing else changes.
            debug!(connection = %connection_id, error = %e, "Rejected invalid frame");
            metrics::record_error("protocol");
            state
                .hub
                .send_error(connection_id, code::ERR_PROTOCOL, &e.to_string());
        }
    }
    metrics::record_latency(start.elapsed().as_secs_f64());
}
