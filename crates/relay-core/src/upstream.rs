//! Resilient upstream client.
//!
//! [`ResilientUpstreamClient`] keeps one logical subscription to an external
//! push source alive across any number of transport reconnects. Every payload
//! it reads goes to a [`Sink`]; a failing sink is logged and otherwise
//! ignored. The reconnect rules live in [`UpstreamMachine`]; this module only
//! performs the I/O the machine asks for.

use crate::backoff::{Backoff, DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX};
use crate::machine::{reconnect_delay, UpstreamAction, UpstreamMachine, UpstreamState};
use crate::sink::Sink;
use bytes::Bytes;
use relay_protocol::{codec, ControlFrame};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tenvis_relay_transport::{Connector, Inbound, Link, TransportError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Handshake payload sent after every successful connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionMessage {
    /// Sent as-is.
    Text(String),
    /// Serialized to JSON text before sending.
    Json(serde_json::Value),
}

impl SubscriptionMessage {
    /// The text put on the wire.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            SubscriptionMessage::Text(text) => text.clone(),
            SubscriptionMessage::Json(value) => value.to_string(),
        }
    }
}

impl From<String> for SubscriptionMessage {
    fn from(text: String) -> Self {
        SubscriptionMessage::Text(text)
    }
}

impl From<&str> for SubscriptionMessage {
    fn from(text: &str) -> Self {
        SubscriptionMessage::Text(text.to_string())
    }
}

impl From<serde_json::Value> for SubscriptionMessage {
    fn from(value: serde_json::Value) -> Self {
        SubscriptionMessage::Json(value)
    }
}

/// Upstream client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Source URL.
    pub url: String,

    /// Handshake sent after every connect.
    #[serde(default)]
    pub subscription_message: Option<SubscriptionMessage>,

    /// Delay before the first reconnect, in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Reconnect delay cap, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Heartbeat interval in milliseconds (0 disables).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL.as_millis() as u64
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX.as_millis() as u64
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

impl UpstreamConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscription_message: None,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }

    /// Set the handshake message.
    #[must_use]
    pub fn with_subscription_message(mut self, message: impl Into<SubscriptionMessage>) -> Self {
        self.subscription_message = Some(message.into());
        self
    }

    /// Set the backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.backoff_initial_ms = initial_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    /// Set the heartbeat interval (0 disables).
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// The configured backoff.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::from_millis(self.backoff_initial_ms, self.backoff_max_ms)
    }

    /// The heartbeat period, if enabled.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

/// Callback fired when the upstream answers a heartbeat.
pub type PongHandler = Arc<dyn Fn() + Send + Sync>;

/// Live changes to the subscription set.
#[derive(Debug)]
enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// How an open link ended.
enum LinkEnd {
    Closed,
    Shutdown,
}

/// Keeps one upstream subscription alive and forwards everything it reads.
pub struct ResilientUpstreamClient {
    config: UpstreamConfig,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn Sink>,
    on_pong: Option<PongHandler>,
    machine: Arc<Mutex<UpstreamMachine>>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientUpstreamClient {
    /// Create a client. Nothing happens until [`start`](Self::start).
    #[must_use]
    pub fn new(config: UpstreamConfig, connector: Arc<dyn Connector>, sink: Arc<dyn Sink>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let machine = UpstreamMachine::new(config.backoff());

        Self {
            config,
            connector,
            sink,
            on_pong: None,
            machine: Arc::new(Mutex::new(machine)),
            subscriptions: Arc::new(Mutex::new(BTreeSet::new())),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            shutdown_tx: watch::Sender::new(false),
            task: Mutex::new(None),
        }
    }

    /// Call `handler` whenever the upstream answers a heartbeat.
    ///
    /// A missing pong never forces a reconnect.
    #[must_use]
    pub fn with_pong_handler(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_pong = Some(Arc::new(handler));
        self
    }

    /// Get the client configuration.
    #[must_use]
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Start connecting.
    ///
    /// Only the first call has any effect.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(&self) {
        if lock(&self.machine).start().is_empty() {
            warn!(url = %self.config.url, "Upstream client already started or shut down");
            return;
        }
        let Some(commands) = lock(&self.command_rx).take() else {
            return;
        };

        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(
            Arc::clone(&self.sink),
            forward_rx,
            Arc::clone(&self.machine),
            self.config.url.clone(),
        ));

        let driver = Driver {
            url: self.config.url.clone(),
            subscription_message: self.config.subscription_message.as_ref().map(SubscriptionMessage::to_text),
            heartbeat: self.config.heartbeat_interval(),
            connector: Arc::clone(&self.connector),
            forward_tx,
            on_pong: self.on_pong.clone(),
            machine: Arc::clone(&self.machine),
            subscriptions: Arc::clone(&self.subscriptions),
            commands,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        info!(url = %self.config.url, transport = self.connector.name(), "Starting upstream client");
        *lock(&self.task) = Some(tokio::spawn(driver.run()));
    }

    /// Stop for good: cancel timers, close the transport, never reconnect.
    ///
    /// Returns once the connection task has finished.
    pub async fn shutdown(&self) {
        let actions = lock(&self.machine).shutdown();
        if actions.is_empty() {
            return;
        }
        if actions.contains(&UpstreamAction::CancelTimers) {
            self.shutdown_tx.send_replace(true);
        }

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(url = %self.config.url, error = %e, "Upstream task ended abnormally");
            }
        }
        info!(url = %self.config.url, "Upstream client shut down");
    }

    /// True only while connected and subscribed upstream.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        lock(&self.machine).is_ready()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> UpstreamState {
        lock(&self.machine).state()
    }

    /// Failed attempts since the last successful connect.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        lock(&self.machine).retry_count()
    }

    /// Add channels to the subscription set.
    ///
    /// New names are sent upstream right away when connected, and are part of
    /// the handshake after every reconnect.
    pub fn subscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added: Vec<String> = {
            let mut set = lock(&self.subscriptions);
            channels
                .into_iter()
                .map(Into::into)
                .filter(|name| set.insert(name.clone()))
                .collect()
        };
        if !added.is_empty() {
            let _ = self.command_tx.send(Command::Subscribe(added));
        }
    }

    /// Remove channels from the subscription set.
    pub fn unsubscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let removed: Vec<String> = {
            let mut set = lock(&self.subscriptions);
            channels
                .into_iter()
                .map(Into::into)
                .filter(|name| set.remove(name))
                .collect()
        };
        if !removed.is_empty() {
            let _ = self.command_tx.send(Command::Unsubscribe(removed));
        }
    }

    /// Channels currently in the subscription set.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).iter().cloned().collect()
    }
}

/// The connection task.
struct Driver {
    url: String,
    subscription_message: Option<String>,
    heartbeat: Option<Duration>,
    connector: Arc<dyn Connector>,
    forward_tx: mpsc::UnboundedSender<Bytes>,
    on_pong: Option<PongHandler>,
    machine: Arc<Mutex<UpstreamMachine>>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown_rx) => break,
                attempt = self.connector.connect(&self.url) => attempt,
            };

            match attempt {
                Ok(mut link) => {
                    if lock(&self.machine).on_open().contains(&UpstreamAction::CloseTransport) {
                        let _ = link.close().await;
                        break;
                    }
                    if let LinkEnd::Shutdown = self.run_open(link.as_mut()).await {
                        let _ = link.close().await;
                        break;
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Upstream connect failed");
                    lock(&self.machine).on_error();
                }
            }

            let (delay, attempt_no) = {
                let mut machine = lock(&self.machine);
                let delay = reconnect_delay(&machine.on_close());
                (delay, machine.retry_count())
            };
            let Some(delay) = delay else { break };

            info!(
                url = %self.url,
                delay_ms = delay.as_millis() as u64,
                attempt = attempt_no,
                "Reconnecting upstream"
            );

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown_rx) => break,
                _ = time::sleep(delay) => {}
            }

            if !lock(&self.machine)
                .on_reconnect_timer()
                .contains(&UpstreamAction::Connect)
            {
                break;
            }
        }

        debug!(url = %self.url, "Upstream driver stopped");
    }

    /// Serve an open link until it closes or shutdown is requested.
    async fn run_open(&mut self, link: &mut dyn Link) -> LinkEnd {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handshake = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => return LinkEnd::Shutdown,
            result = self.handshake(link) => result,
        };
        if let Err(e) = handshake {
            warn!(url = %self.url, error = %e, "Upstream handshake failed");
            lock(&self.machine).on_error();
            let _ = link.close().await;
            return LinkEnd::Closed;
        }
        lock(&self.machine).on_subscribed();
        info!(url = %self.url, "Upstream connected");

        let mut heartbeat = self.heartbeat.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown_rx) => return LinkEnd::Shutdown,
                Some(command) = self.commands.recv() => {
                    if let Err(e) = send_command(link, command).await {
                        warn!(url = %self.url, error = %e, "Upstream send failed");
                        lock(&self.machine).on_error();
                        return LinkEnd::Closed;
                    }
                }
                _ = next_tick(&mut heartbeat) => {
                    trace!(url = %self.url, "Sending heartbeat");
                    if let Err(e) = send_control(link, &ControlFrame::ping()).await {
                        warn!(url = %self.url, error = %e, "Heartbeat failed");
                        lock(&self.machine).on_error();
                        return LinkEnd::Closed;
                    }
                }
                received = link.recv() => match received {
                    Ok(Some(inbound)) => self.dispatch(inbound),
                    Ok(None) => {
                        info!(url = %self.url, "Upstream closed");
                        return LinkEnd::Closed;
                    }
                    Err(e) => {
                        warn!(url = %self.url, error = %e, "Upstream receive failed");
                        lock(&self.machine).on_error();
                        return LinkEnd::Closed;
                    }
                },
            }
        }
    }

    /// Send the subscription message, then the subscription set.
    async fn handshake(&mut self, link: &mut dyn Link) -> Result<(), TransportError> {
        // The full set goes out below, so anything queued while offline is stale.
        while self.commands.try_recv().is_ok() {}

        if let Some(text) = &self.subscription_message {
            link.send_text(text.clone()).await?;
        }

        let channels: Vec<String> = lock(&self.subscriptions).iter().cloned().collect();
        if !channels.is_empty() {
            send_control(link, &ControlFrame::subscribe(channels)).await?;
        }
        Ok(())
    }

    fn dispatch(&self, inbound: Inbound) {
        if inbound.as_text().is_some_and(codec::is_pong) {
            trace!(url = %self.url, "Heartbeat answered");
            if let Some(on_pong) = &self.on_pong {
                on_pong();
            }
            return;
        }
        let _ = self.forward_tx.send(inbound.into_bytes());
    }
}

/// Push forwarded payloads into the sink, in order.
async fn forward(
    sink: Arc<dyn Sink>,
    mut payloads: mpsc::UnboundedReceiver<Bytes>,
    machine: Arc<Mutex<UpstreamMachine>>,
    url: String,
) {
    while let Some(payload) = payloads.recv().await {
        if lock(&machine).is_shutting_down() {
            break;
        }
        if let Err(e) = sink.push(payload).await {
            warn!(url = %url, error = %e, "Sink push failed");
        }
    }
    trace!(url = %url, "Forwarder stopped");
}

async fn send_command(link: &mut dyn Link, command: Command) -> Result<(), TransportError> {
    let frame = match command {
        Command::Subscribe(channels) => ControlFrame::subscribe(channels),
        Command::Unsubscribe(channels) => ControlFrame::unsubscribe(channels),
    };
    send_control(link, &frame).await
}

async fn send_control(link: &mut dyn Link, frame: &ControlFrame) -> Result<(), TransportError> {
    let text = codec::encode_control(frame)?;
    link.send_text(text).await
}

/// Resolve when shutdown is requested or the client is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tenvis_relay_transport::memory::{MemoryConnector, MemoryPeer};

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn client(
        config: UpstreamConfig,
        connector: &Arc<MemoryConnector>,
    ) -> (ResilientUpstreamClient, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let connector: Arc<dyn Connector> = connector.clone();
        (ResilientUpstreamClient::new(config, connector, Arc::new(tx)), rx)
    }

    fn config() -> UpstreamConfig {
        UpstreamConfig::new("mem://source")
            .with_subscription_message(serde_json::json!({"action": "subscribe", "channel": "BTC"}))
            .with_backoff(1_000, 8_000)
            .with_heartbeat_interval(0)
    }

    async fn expect_sent(peer: &mut MemoryPeer, expected: &str) {
        assert_eq!(peer.next_sent().await.as_deref(), Some(expected));
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: UpstreamConfig =
            serde_json::from_str(r#"{"url":"wss://x","subscription_message":{"op":"sub"}}"#)
                .unwrap();
        assert_eq!(config.backoff_initial_ms, 1_000);
        assert_eq!(config.backoff_max_ms, 60_000);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert_eq!(
            config.subscription_message.unwrap().to_text(),
            r#"{"op":"sub"}"#
        );

        let text = SubscriptionMessage::from("raw handshake");
        assert_eq!(text.to_text(), "raw handshake");
        assert_eq!(UpstreamConfig::new("x").with_heartbeat_interval(0).heartbeat_interval(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_then_forwarding() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.push_link();
        let (client, mut sink_rx) = client(config(), &connector);

        assert!(!client.is_ready());
        client.start();

        expect_sent(&mut peer, r#"{"action":"subscribe","channel":"BTC"}"#).await;
        wait_until(|| client.is_ready()).await;
        assert_eq!(client.state(), UpstreamState::Open);

        peer.send_text(r#"{"price":42}"#);
        peer.send_binary(vec![1u8, 2, 3]);
        assert_eq!(sink_rx.recv().await.unwrap(), Bytes::from_static(br#"{"price":42}"#));
        assert_eq!(sink_rx.recv().await.unwrap(), Bytes::from_static(&[1, 2, 3]));

        client.shutdown().await;
        assert!(!client.is_ready());
        assert_eq!(client.state(), UpstreamState::ShuttingDown);
        assert!(peer.is_link_closed());
        assert_eq!(connector.urls(), vec!["mem://source"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff() {
        let connector = Arc::new(MemoryConnector::new());
        connector.push_failure("refused");
        connector.push_failure("refused");
        let mut peer = connector.push_link();
        let (client, _sink_rx) = client(config(), &connector);

        let started = Instant::now();
        client.start();
        wait_until(|| client.is_ready()).await;

        assert_eq!(connector.attempts(), 3);
        assert!(started.elapsed() >= Duration::from_millis(3_000));
        assert_eq!(client.retry_count(), 0);
        expect_sent(&mut peer, r#"{"action":"subscribe","channel":"BTC"}"#).await;

        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_drop() {
        let connector = Arc::new(MemoryConnector::new());
        let mut first = connector.push_link();
        let mut second = connector.push_link();
        let (client, _sink_rx) = client(config(), &connector);
        client.subscribe(["BTC", "ETH"]);

        client.start();
        expect_sent(&mut first, r#"{"action":"subscribe","channel":"BTC"}"#).await;
        expect_sent(&mut first, r#"{"subscribe":["BTC","ETH"]}"#).await;
        wait_until(|| client.is_ready()).await;

        let dropped_at = Instant::now();
        first.close();
        wait_until(|| !client.is_ready()).await;
        assert_eq!(client.state(), UpstreamState::Connecting);

        expect_sent(&mut second, r#"{"action":"subscribe","channel":"BTC"}"#).await;
        expect_sent(&mut second, r#"{"subscribe":["BTC","ETH"]}"#).await;
        wait_until(|| client.is_ready()).await;
        assert!(dropped_at.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(client.retry_count(), 0);

        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_reconnect_schedules_once() {
        let connector = Arc::new(MemoryConnector::new());
        let first = connector.push_link();
        let _second = connector.push_link();
        let (client, _sink_rx) = client(config(), &connector);

        client.start();
        wait_until(|| client.is_ready()).await;

        first.fail("connection reset");
        wait_until(|| client.is_ready() && connector.attempts() == 2).await;
        assert_eq!(client.retry_count(), 0);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 2);

        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_subscription_changes() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.push_link();
        let (client, _sink_rx) = client(config().with_heartbeat_interval(0), &connector);

        client.start();
        expect_sent(&mut peer, r#"{"action":"subscribe","channel":"BTC"}"#).await;
        wait_until(|| client.is_ready()).await;

        client.subscribe(["ETH"]);
        expect_sent(&mut peer, r#"{"subscribe":["ETH"]}"#).await;

        client.subscribe(["ETH"]);
        client.unsubscribe(["ETH", "never"]);
        expect_sent(&mut peer, r#"{"unsubscribe":["ETH"]}"#).await;
        assert!(client.subscriptions().is_empty());

        // Repeats of a known name send nothing.
        client.subscribe(["LTC"]);
        client.subscribe(["LTC"]);
        expect_sent(&mut peer, r#"{"subscribe":["LTC"]}"#).await;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.try_next_sent(), None);

        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_pong() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.push_link();
        let pongs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pongs);
        let (tx, mut sink_rx) = mpsc::unbounded_channel::<Bytes>();
        let client = ResilientUpstreamClient::new(
            config().with_heartbeat_interval(30_000),
            connector.clone(),
            Arc::new(tx),
        )
        .with_pong_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.start();
        expect_sent(&mut peer, r#"{"action":"subscribe","channel":"BTC"}"#).await;
        wait_until(|| client.is_ready()).await;

        time::sleep(Duration::from_millis(30_001)).await;
        expect_sent(&mut peer, r#"{"ping":true}"#).await;

        peer.send_text(r#"{"pong":true}"#);
        peer.send_text("data");
        assert_eq!(sink_rx.recv().await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(pongs.load(Ordering::SeqCst), 1);

        client.shutdown().await;
    }

    /// A link whose sends never complete.
    struct StalledLink;

    #[async_trait]
    impl Link for StalledLink {
        async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Link>, TransportError> {
            Ok(Box::new(StalledLink))
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_until_handshake_sent() {
        let (tx, _sink_rx) = mpsc::unbounded_channel::<Bytes>();
        let client =
            ResilientUpstreamClient::new(config(), Arc::new(StalledConnector), Arc::new(tx));

        client.start();
        wait_until(|| client.state() == UpstreamState::Open).await;
        time::sleep(Duration::from_secs(5)).await;
        assert!(!client.is_ready());

        client.shutdown().await;
        assert_eq!(client.state(), UpstreamState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handshake_reconnects() {
        let connector = Arc::new(MemoryConnector::new());
        drop(connector.push_link());
        let mut peer = connector.push_link();
        let (client, _sink_rx) = client(config(), &connector);

        client.start();
        wait_until(|| connector.attempts() == 1).await;
        assert!(!client.is_ready());

        expect_sent(&mut peer, r#"{"action":"subscribe","channel":"BTC"}"#).await;
        wait_until(|| client.is_ready()).await;
        assert_eq!(connector.attempts(), 2);

        client.shutdown().await;
    }

    struct FlakySink {
        calls: AtomicUsize,
        delivered: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn push(&self, data: Bytes) -> Result<(), SinkError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SinkError::Rejected("first push fails".into()));
            }
            let _ = self.delivered.send(data);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_not_fatal() {
        let connector = Arc::new(MemoryConnector::new());
        let peer = connector.push_link();
        let (tx, mut delivered) = mpsc::unbounded_channel();
        let sink = Arc::new(FlakySink {
            calls: AtomicUsize::new(0),
            delivered: tx,
        });
        let client = ResilientUpstreamClient::new(config(), connector.clone(), sink.clone());

        client.start();
        wait_until(|| client.is_ready()).await;

        peer.send_text("lost");
        peer.send_text("kept");
        assert_eq!(delivered.recv().await.unwrap(), Bytes::from_static(b"kept"));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert!(client.is_ready());
        assert_eq!(connector.attempts(), 1);

        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let connector = Arc::new(MemoryConnector::new());
        let (client, _sink_rx) = client(config(), &connector);

        client.start();
        wait_until(|| connector.attempts() == 1).await;
        assert_eq!(client.state(), UpstreamState::Connecting);
        assert_eq!(client.retry_count(), 1);

        client.shutdown().await;
        time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.attempts(), 1);
        assert!(!client.is_ready());
        assert_eq!(client.state(), UpstreamState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_and_shutdown_before_start() {
        let connector = Arc::new(MemoryConnector::new());
        let _peer = connector.push_link();
        let (client, _sink_rx) = client(config(), &connector);

        client.start();
        client.start();
        wait_until(|| client.is_ready()).await;
        assert_eq!(connector.attempts(), 1);
        client.shutdown().await;
        client.shutdown().await;

        let (idle, _rx) = self::client(config(), &connector);
        idle.shutdown().await;
        idle.start();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(idle.state(), UpstreamState::ShuttingDown);
        assert_eq!(connector.attempts(), 1);
    }
}
