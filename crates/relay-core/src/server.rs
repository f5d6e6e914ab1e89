//! The channel broadcast server.
//!
//! [`ChannelBroadcastServer`] tracks which downstream connections listen to
//! which channels, fans payloads out to them, and tells its
//! [`ChannelHooks`] when a channel gains its first subscriber or loses its
//! last one.

use crate::channel::{validate_channel_name, ChannelId};
use crate::connection::ConnectionHandle;
use crate::error::RelayError;
use crate::hooks::ChannelHooks;
use crate::registry::{ChannelRegistry, RegistryStats, SubscribeOutcome};
use relay_protocol::codec::{self, MAX_FRAME_SIZE};
use relay_protocol::{ErrorCode, ServerFrame};
use std::sync::Arc;
use tenvis_relay_transport::ConnectionId;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The only request path WebSocket upgrades are accepted on.
    pub path: String,
    /// Maximum subscriptions per connection (0 = unlimited).
    pub max_subscriptions_per_connection: usize,
    /// Maximum control frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_subscriptions_per_connection: 100,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// What became of a single subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionResult {
    /// Recorded.
    Subscribed,
    /// Already subscribed; nothing changed.
    AlreadySubscribed,
    /// Refused; an error frame with this code was sent to the connection.
    Rejected(ErrorCode),
    /// The connection is not (or no longer) registered.
    NotConnected,
}

/// Work for the hook dispatcher.
enum HookCall {
    Subscribe(ChannelId),
    Unsubscribe(ChannelId),
    Flush(oneshot::Sender<()>),
}

/// Broadcast server with per-channel activation hooks.
pub struct ChannelBroadcastServer {
    registry: ChannelRegistry,
    hooks: Arc<dyn ChannelHooks>,
    hook_tx: mpsc::UnboundedSender<HookCall>,
    config: ServerConfig,
    closed: watch::Sender<bool>,
}

impl ChannelBroadcastServer {
    /// Create a server and start its hook dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn new(config: ServerConfig, hooks: Arc<dyn ChannelHooks>) -> Self {
        info!("Creating broadcast server with config: {:?}", config);

        let (hook_tx, hook_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hooks(Arc::clone(&hooks), hook_rx));

        Self {
            registry: ChannelRegistry::new(),
            hooks,
            hook_tx,
            config,
            closed: watch::Sender::new(false),
        }
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Check whether connections on `path` should be accepted.
    #[must_use]
    pub fn accepts_path(&self, path: &str) -> bool {
        path == self.config.path
    }

    /// Register a new connection with no subscriptions.
    ///
    /// After [`close`](Self::close) the connection is closed straight away.
    pub fn handle_connect(&self, connection: ConnectionHandle) {
        if self.is_closed() {
            debug!(connection = %connection.id(), "Rejecting connection: server closed");
            connection.close();
            return;
        }
        if !self.registry.register(connection.clone()) {
            return;
        }
        debug!(connection = %connection.id(), "Connection registered");

        // A close() that ran between the check above and the insert has
        // already taken its snapshot and would miss this connection.
        if self.is_closed() {
            debug!(connection = %connection.id(), "Server closed during connect");
            connection.close();
            self.handle_disconnect(&connection);
        }
    }

    /// Process one raw frame from a connection.
    ///
    /// Malformed frames are dropped without a reply. A ping is answered
    /// before any subscribe or unsubscribe in the same frame; both lists are
    /// then processed in order.
    pub async fn handle_message(&self, connection: &ConnectionHandle, raw: &str) {
        if self.is_closed() {
            return;
        }

        let frame = match codec::decode_control_with_limit(raw, self.config.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(connection = %connection.id(), error = %e, "Dropping malformed frame");
                return;
            }
        };

        if frame.ping {
            self.reply(connection, &ServerFrame::pong());
        }
        for channel in &frame.subscribe {
            let _ = self.subscribe(connection, channel).await;
        }
        for channel in &frame.unsubscribe {
            self.unsubscribe(connection, channel);
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Rejections are reported to the connection as an error frame and leave
    /// its other subscriptions untouched.
    pub async fn subscribe(&self, connection: &ConnectionHandle, channel: &str) -> SubscriptionResult {
        let id = connection.id();
        if !self.registry.is_registered(id) {
            return SubscriptionResult::NotConnected;
        }
        if self.registry.is_subscribed(id, channel) {
            return SubscriptionResult::AlreadySubscribed;
        }

        if let Err(reason) = validate_channel_name(channel) {
            debug!(connection = %id, channel = %channel, reason, "Invalid channel name");
            return self.reject(connection, channel, ErrorCode::InvalidChannel);
        }

        let limit = self.config.max_subscriptions_per_connection;
        if limit > 0 && self.registry.subscription_count(id) >= limit {
            debug!(connection = %id, channel = %channel, limit, "Subscription limit reached");
            return self.reject(connection, channel, ErrorCode::TooManySubscriptions);
        }

        if !self.hooks.is_valid_channel(channel).await {
            debug!(connection = %id, channel = %channel, "Channel rejected by validator");
            return self.reject(connection, channel, ErrorCode::InvalidChannel);
        }

        let hook_tx = &self.hook_tx;
        match self.registry.subscribe(id, channel, |name| {
            let _ = hook_tx.send(HookCall::Subscribe(name.to_string()));
        }) {
            SubscribeOutcome::Subscribed { .. } => SubscriptionResult::Subscribed,
            SubscribeOutcome::AlreadySubscribed => SubscriptionResult::AlreadySubscribed,
            SubscribeOutcome::UnknownConnection => SubscriptionResult::NotConnected,
        }
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, connection: &ConnectionHandle, channel: &str) -> bool {
        let hook_tx = &self.hook_tx;
        self.registry.unsubscribe(connection.id(), channel, |name| {
            let _ = hook_tx.send(HookCall::Unsubscribe(name.to_string()));
        })
    }

    /// Forget a connection, leaving all of its channels first.
    pub fn handle_disconnect(&self, connection: &ConnectionHandle) {
        connection.mark_closed();
        let hook_tx = &self.hook_tx;
        if let Some((_, channels)) = self.registry.remove_connection(connection.id(), |name| {
            let _ = hook_tx.send(HookCall::Unsubscribe(name.to_string()));
        }) {
            debug!(connection = %connection.id(), channels = channels.len(), "Connection disconnected");
        }
    }

    /// Send `payload` verbatim to every open subscriber of `channel`.
    ///
    /// Broadcasting to a channel nobody listens to is a no-op. Returns the
    /// number of connections the payload was queued to.
    pub fn broadcast(&self, channel: &str, payload: impl Into<Arc<str>>) -> usize {
        let payload = payload.into();
        let delivered = self.registry.broadcast(channel, &payload, |connection, source| {
            self.hooks.on_error(&RelayError::Send {
                connection: connection.clone(),
                source,
            });
        });
        trace!(channel = %channel, recipients = delivered, "Broadcast");
        delivered
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry.subscriber_count(channel)
    }

    /// Names of all channels with at least one subscriber, sorted.
    #[must_use]
    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.registry.active_channels()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    /// Channels a connection is subscribed to, sorted.
    #[must_use]
    pub fn connection_channels(&self, connection_id: &ConnectionId) -> Vec<ChannelId> {
        self.registry.connection_channels(connection_id)
    }

    /// Get server statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Close every connection and stop accepting new ones.
    ///
    /// Each connection leaves its channels as on disconnect, so deactivation
    /// hooks still fire. Calling this more than once is harmless.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let handles = self.registry.handles();
        info!(connections = handles.len(), "Closing broadcast server");
        for handle in handles {
            handle.close();
            self.handle_disconnect(&handle);
        }
    }

    /// Check whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the server has been closed.
    ///
    /// Hand this to the listener as its shutdown signal.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Wait until every hook call queued so far has completed.
    pub async fn flush_hooks(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.hook_tx.send(HookCall::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn reply(&self, connection: &ConnectionHandle, frame: &ServerFrame) {
        let result = codec::encode_server(frame)
            .map_err(RelayError::from)
            .and_then(|text| {
                connection.send(text).map_err(|source| RelayError::Send {
                    connection: connection.id().clone(),
                    source,
                })
            });
        if let Err(e) = result {
            self.hooks.on_error(&e);
        }
    }

    fn reject(&self, connection: &ConnectionHandle, channel: &str, code: ErrorCode) -> SubscriptionResult {
        let frame = ServerFrame::Error {
            code,
            channel: channel.to_string(),
        };
        self.reply(connection, &frame);
        SubscriptionResult::Rejected(code)
    }
}

/// Run activation hooks one at a time, in transition order.
async fn run_hooks(hooks: Arc<dyn ChannelHooks>, mut calls: mpsc::UnboundedReceiver<HookCall>) {
    while let Some(call) = calls.recv().await {
        match call {
            HookCall::Subscribe(channel) => {
                trace!(channel = %channel, "Running on_subscribe");
                hooks.on_subscribe(&channel).await;
            }
            HookCall::Unsubscribe(channel) => {
                trace!(channel = %channel, "Running on_unsubscribe");
                hooks.on_unsubscribe(&channel).await;
            }
            HookCall::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!("Hook dispatcher stopped");
}
