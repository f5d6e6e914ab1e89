//! Connection handlers for Relay server.
//!
//! This module wires the broadcast server to axum: WebSocket sessions,
//! health and readiness probes, the publish pump and graceful shutdown.

use crate::config::Config;
use crate::metrics::{self, SessionMetrics};
use crate::upstreams::{Publication, UpstreamPool};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tenvis_relay_core::{ChannelBroadcastServer, ChannelHooks, ConnectionHandle, Outgoing};
use tenvis_relay_transport::{ConnectionId, Connector, WebSocketConnector};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Shared server state.
pub struct AppState {
    /// The broadcast server.
    pub server: Arc<ChannelBroadcastServer>,
    /// Upstream clients, one per active channel.
    pub pool: Arc<UpstreamPool>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create the server, its upstream pool and the publish pump.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(UpstreamPool::new(&config, connector, publish_tx));
        let hooks: Arc<dyn ChannelHooks> = pool.clone();
        let server = Arc::new(ChannelBroadcastServer::new(config.server_config(), hooks));

        tokio::spawn(run_publisher(Arc::clone(&server), publish_rx));

        Arc::new(Self {
            server,
            pool,
            config,
        })
    }

    /// Close every connection, then stop every upstream.
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.server.close();
        self.server.flush_hooks().await;
        self.pool.shutdown_all().await;
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.server.config().path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector::new());
    let state = AppState::new(config.clone(), connector);
    let app = router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("Relay server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or once the broadcast server is closed, after
/// releasing every connection and upstream.
async fn shutdown_signal(state: Arc<AppState>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
        _ = state.server.closed() => {}
    }
    state.shutdown().await;
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness handler: 200 only while every active upstream is connected.
async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    let pending = state.pool.pending();
    metrics::set_pending_upstreams(pending.len());
    let ready = pending.is_empty() && !state.server.is_closed();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = axum::Json(serde_json::json!({
        "ready": ready,
        "upstreams": state.pool.len(),
        "pending": pending,
    }));
    (status, body).into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    uri: Uri,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !state.server.accepts_path(uri.path()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.server.connection_count() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_rejection("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let mut session = SessionMetrics::open();

    let (handle, mut outgoing) = ConnectionHandle::new(ConnectionId::generate());
    let connection_id = handle.id().clone();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    state.server.handle_connect(handle.clone());

    // Writer: drain the handle's queue onto the socket.
    let mut writer = tokio::spawn(async move {
        while let Some(item) = outgoing.recv().await {
            match item {
                Outgoing::Text(text) => {
                    metrics::record_delivery();
                    if sender.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    // Reader: frames are handled one at a time, in arrival order.
    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(connection = %connection_id, "Writer finished");
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&state, &handle, &mut session, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_text(&state, &handle, &mut session, text).await,
                        Err(_) => {
                            trace!(connection = %connection_id, "Dropping non-UTF-8 frame");
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Answered by the WebSocket layer
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.server.handle_disconnect(&handle);
    writer.abort();
    metrics::set_active_channels(state.server.stats().channel_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

async fn handle_text(
    state: &AppState,
    handle: &ConnectionHandle,
    session: &mut SessionMetrics,
    text: &str,
) {
    session.control_frame(text.len());
    state.server.handle_message(handle, text).await;
    metrics::set_active_channels(state.server.stats().channel_count);
}

/// Wrap an upstream payload for downstream clients.
///
/// JSON payloads are embedded as-is; anything else becomes a string.
#[must_use]
pub fn wrap_payload(channel: &str, data: &[u8]) -> String {
    let data = serde_json::from_slice::<serde_json::Value>(data).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(data).into_owned())
    });
    serde_json::json!({ "channel": channel, "data": data }).to_string()
}

/// Broadcast every upstream payload to its channel.
async fn run_publisher(
    server: Arc<ChannelBroadcastServer>,
    mut publications: mpsc::UnboundedReceiver<Publication>,
) {
    while let Some((channel, data)) = publications.recv().await {
        let text = wrap_payload(&channel, &data);
        let recipients = server.broadcast(&channel, text);
        metrics::record_publication(data.len(), recipients);
        trace!(channel = %channel, recipients, "Published upstream payload");
    }
    debug!("Publish queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tenvis_relay_transport::memory::MemoryConnector;
    use tenvis_relay_transport::TransportError;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn config(url: &str) -> Config {
        let mut config = Config::default();
        config.upstream.url = url.to_string();
        config.upstream.subscription_message =
            Some(r#"{"op":"subscribe","channel":"{channel}"}"#.to_string());
        config.upstream.heartbeat_interval_ms = 0;
        config
    }

    async fn next_text(rx: &mut UnboundedReceiver<Outgoing>) -> String {
        match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            Outgoing::Text(text) => text.to_string(),
            Outgoing::Close => panic!("unexpected close"),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_wrap_payload() {
        assert_eq!(
            wrap_payload("BTC", br#"{"price":1}"#),
            r#"{"channel":"BTC","data":{"price":1}}"#
        );
        assert_eq!(
            wrap_payload("BTC", b"plain text"),
            r#"{"channel":"BTC","data":"plain text"}"#
        );
    }

    #[tokio::test]
    async fn test_upstream_follows_channel_activation() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.push_link();
        let state = AppState::new(config("mem://feed/{channel}"), connector.clone());

        let (alice, mut alice_rx) = ConnectionHandle::new("alice");
        state.server.handle_connect(alice.clone());
        state
            .server
            .handle_message(&alice, r#"{"subscribe":["BTC"]}"#)
            .await;
        state.server.flush_hooks().await;

        assert!(state.pool.contains("BTC"));
        let handshake = timeout(WAIT, peer.next_sent()).await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&handshake).unwrap(),
            serde_json::json!({"op": "subscribe", "channel": "BTC"})
        );
        assert_eq!(connector.urls(), vec!["mem://feed/BTC"]);

        let pool = Arc::clone(&state.pool);
        wait_until(move || pool.is_ready()).await;

        peer.send_text(r#"{"price":42000}"#);
        assert_eq!(
            next_text(&mut alice_rx).await,
            r#"{"channel":"BTC","data":{"price":42000}}"#
        );

        state.server.handle_disconnect(&alice);
        state.server.flush_hooks().await;
        assert!(state.pool.is_empty());
        assert!(peer.is_link_closed());
    }

    #[tokio::test]
    async fn test_secure_upstream_urls_are_supported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let result = WebSocketConnector::new()
            .connect(&format!("wss://{}/BTC", addr))
            .await;
        let Err(TransportError::ConnectFailed(reason)) = result else {
            panic!("a plain TCP peer cannot complete a TLS handshake");
        };
        assert!(!reason.contains("TLS support not compiled in"), "{reason}");
    }

    #[tokio::test]
    async fn test_allow_list_rejects_channel() {
        let mut config = config("");
        config.channels.allow = vec!["BTC".to_string()];
        let state = AppState::new(config, Arc::new(MemoryConnector::new()));

        let (conn, mut rx) = ConnectionHandle::new("c1");
        state.server.handle_connect(conn.clone());
        state
            .server
            .handle_message(&conn, r#"{"subscribe":["DOGE","BTC"]}"#)
            .await;
        state.server.flush_hooks().await;

        assert_eq!(
            next_text(&mut rx).await,
            r#"{"error":"invalid_channel","channel":"DOGE"}"#
        );
        assert_eq!(state.server.active_channels(), vec!["BTC"]);
        // No upstream URL, so nothing is started.
        assert!(state.pool.is_empty());
    }

    #[tokio::test]
    async fn test_ready_reports_pending_upstreams() {
        let connector = Arc::new(MemoryConnector::new());
        let state = AppState::new(config("mem://{channel}"), connector.clone());

        let ready = ready_handler(State(Arc::clone(&state))).await;
        assert_eq!(ready.status(), StatusCode::OK);

        let (conn, _rx) = ConnectionHandle::new("c1");
        state.server.handle_connect(conn.clone());
        state
            .server
            .handle_message(&conn, r#"{"subscribe":["ETH"]}"#)
            .await;
        state.server.flush_hooks().await;

        let c = Arc::clone(&connector);
        wait_until(move || c.attempts() >= 1).await;
        assert_eq!(state.pool.pending(), vec!["ETH"]);

        let not_ready = ready_handler(State(Arc::clone(&state))).await;
        assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let connector = Arc::new(MemoryConnector::new());
        let peer = connector.push_link();
        let state = AppState::new(config("mem://{channel}"), connector.clone());

        let (conn, mut rx) = ConnectionHandle::new("c1");
        state.server.handle_connect(conn.clone());
        state
            .server
            .handle_message(&conn, r#"{"subscribe":["BTC"]}"#)
            .await;
        state.server.flush_hooks().await;
        let pool = Arc::clone(&state.pool);
        wait_until(move || pool.is_ready()).await;

        state.shutdown().await;

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(Outgoing::Close));
        assert!(state.pool.is_empty());
        assert!(peer.is_link_closed());
        assert_eq!(state.server.connection_count(), 0);

        let ready = ready_handler(State(Arc::clone(&state))).await;
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
