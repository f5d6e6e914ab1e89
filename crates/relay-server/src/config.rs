//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (RELAY_HOST, RELAY_PORT, RELAY_UPSTREAM_URL),
//!   which win over the file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tenvis_relay_core::{ServerConfig, SubscriptionMessage, UpstreamConfig};

/// Placeholder replaced by the channel name in upstream templates.
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Upstream source.
    #[serde(default)]
    pub upstream: UpstreamSection,

    /// Channel allow list.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per connection (0 = unlimited).
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum control frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Upstream configuration, templated per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// Source URL; `{channel}` is replaced by the channel name.
    /// Empty disables upstreams.
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Handshake text; `{channel}` is replaced by the channel name.
    #[serde(default)]
    pub subscription_message: Option<String>,

    /// Delay before the first reconnect, in milliseconds.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Reconnect delay cap, in milliseconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Heartbeat interval in milliseconds (0 disables).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

/// Channel allow list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Channels clients may subscribe to. Empty allows any valid name.
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_upstream_url() -> String {
    String::new()
}

fn default_backoff_initial() -> u64 {
    1_000
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            upstream: UpstreamSection::default(),
            channels: ChannelsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            subscription_message: None,
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl UpstreamSection {
    /// Whether an upstream URL is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty()
    }

    /// Build the client configuration for one channel.
    ///
    /// The channel is percent-encoded into the URL. A JSON handshake template
    /// gets the channel as a string value; any other template is plain text
    /// substitution. Returns `None` when no upstream is configured.
    #[must_use]
    pub fn for_channel(&self, channel: &str) -> Option<UpstreamConfig> {
        if !self.is_enabled() {
            return None;
        }

        let url = self
            .url
            .replace(CHANNEL_PLACEHOLDER, &encode_path_segment(channel));
        let mut config = UpstreamConfig::new(url)
            .with_backoff(self.backoff_initial_ms, self.backoff_max_ms)
            .with_heartbeat_interval(self.heartbeat_interval_ms);
        if let Some(template) = &self.subscription_message {
            config = config.with_subscription_message(render_handshake(template, channel));
        }
        Some(config)
    }
}

/// Percent-encode `channel` as a single URL path segment.
fn encode_path_segment(channel: &str) -> String {
    let encoded = urlencoding::encode(channel).into_owned();
    // Dots are unreserved, but "." and ".." still move up the path.
    if encoded.chars().all(|c| c == '.') {
        encoded.replace('.', "%2E")
    } else {
        encoded
    }
}

fn render_handshake(template: &str, channel: &str) -> SubscriptionMessage {
    match serde_json::from_str::<serde_json::Value>(template) {
        Ok(mut value) => {
            fill_placeholder(&mut value, channel);
            SubscriptionMessage::Json(value)
        }
        Err(_) => SubscriptionMessage::Text(template.replace(CHANNEL_PLACEHOLDER, channel)),
    }
}

/// Substitute the channel inside every string value of `value`.
fn fill_placeholder(value: &mut serde_json::Value, channel: &str) {
    match value {
        serde_json::Value::String(text) if text.contains(CHANNEL_PLACEHOLDER) => {
            *text = text.replace(CHANNEL_PLACEHOLDER, channel);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                fill_placeholder(item, channel);
            }
        }
        serde_json::Value::Object(fields) => {
            for field in fields.values_mut() {
                fill_placeholder(field, channel);
            }
        }
        _ => {}
    }
}

impl Config {
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        let mut config = None;
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                config = Some(Self::from_file(expanded.as_ref())?);
                break;
            }
        }

        let mut config = config.unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `RELAY_*` overrides looked up through `lookup`.
    ///
    /// An unparsable `RELAY_PORT` is ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("RELAY_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("RELAY_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(url) = lookup("RELAY_UPSTREAM_URL") {
            self.upstream.url = url;
        }
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Settings for the broadcast server.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            path: self.transport.websocket_path.clone(),
            max_subscriptions_per_connection: self.limits.max_subscriptions_per_connection,
            max_frame_size: self.limits.max_message_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert!(!config.upstream.is_enabled());
        assert!(config.channels.allow.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [upstream]
            url = "wss://feed.example.com/{channel}"
            subscription_message = '{"op":"subscribe","args":["{channel}"]}'
            backoff_max_ms = 10000

            [channels]
            allow = ["BTC", "ETH"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_subscriptions_per_connection, 100);
        assert_eq!(config.upstream.backoff_initial_ms, 1_000);
        assert_eq!(config.upstream.backoff_max_ms, 10_000);
        assert_eq!(config.channels.allow, vec!["BTC", "ETH"]);
    }

    #[test]
    fn test_upstream_for_channel() {
        let section = UpstreamSection {
            url: "wss://feed.example.com/{channel}".into(),
            subscription_message: Some(r#"{"op":"subscribe","args":["{channel}"]}"#.into()),
            ..UpstreamSection::default()
        };

        let upstream = section.for_channel("BTC").unwrap();
        assert_eq!(upstream.url, "wss://feed.example.com/BTC");
        let handshake: serde_json::Value =
            serde_json::from_str(&upstream.subscription_message.unwrap().to_text()).unwrap();
        assert_eq!(
            handshake,
            serde_json::json!({"op": "subscribe", "args": ["BTC"]})
        );
        assert_eq!(upstream.heartbeat_interval_ms, 30_000);

        assert!(UpstreamSection::default().for_channel("BTC").is_none());
    }

    #[test]
    fn test_channel_cannot_rewrite_handshake() {
        let section = UpstreamSection {
            url: "ws://feed.example.com/{channel}".into(),
            subscription_message: Some(r#"{"op":"subscribe","channel":"{channel}"}"#.into()),
            ..UpstreamSection::default()
        };

        let channel = r#"BTC","op":"unsubscribe"#;
        let upstream = section.for_channel(channel).unwrap();
        let handshake: serde_json::Value =
            serde_json::from_str(&upstream.subscription_message.unwrap().to_text()).unwrap();
        assert_eq!(handshake["op"], "subscribe");
        assert_eq!(handshake["channel"], channel);
        assert_eq!(handshake.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_channel_cannot_rewrite_url() {
        let section = UpstreamSection {
            url: "ws://feed.example.com/{channel}".into(),
            ..UpstreamSection::default()
        };

        let upstream = section.for_channel("../admin?x=1#").unwrap();
        assert_eq!(upstream.url, "ws://feed.example.com/..%2Fadmin%3Fx%3D1%23");

        let upstream = section.for_channel("..").unwrap();
        assert_eq!(upstream.url, "ws://feed.example.com/%2E%2E");

        let upstream = section.for_channel("BTC-USD.spot").unwrap();
        assert_eq!(upstream.url, "ws://feed.example.com/BTC-USD.spot");
    }

    #[test]
    fn test_plain_text_handshake_template() {
        let section = UpstreamSection {
            url: "ws://feed.example.com/".into(),
            subscription_message: Some("SUB {channel}".into()),
            ..UpstreamSection::default()
        };

        let upstream = section.for_channel("BTC").unwrap();
        assert_eq!(
            upstream.subscription_message.unwrap().to_text(),
            "SUB BTC"
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RELAY_HOST", "0.0.0.0"),
            ("RELAY_PORT", "not-a-port"),
            ("RELAY_UPSTREAM_URL", "ws://localhost:9001/{channel}"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.upstream.url, "ws://localhost:9001/{channel}");
    }

    #[test]
    fn test_server_config_mapping() {
        let mut config = Config::default();
        config.transport.websocket_path = "/stream".into();
        config.limits.max_subscriptions_per_connection = 0;

        let server = config.server_config();
        assert_eq!(server.path, "/stream");
        assert_eq!(server.max_subscriptions_per_connection, 0);
        assert_eq!(server.max_frame_size, 64 * 1024);
    }
}
