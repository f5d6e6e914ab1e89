//! Per-channel upstream clients driven by channel activation.
//!
//! The first subscriber to a channel starts a [`ResilientUpstreamClient`] for
//! it; the last one leaving shuts it down. Every upstream payload is tagged
//! with its channel and pushed onto the publish queue.

use crate::config::{Config, UpstreamSection};
use crate::metrics;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tenvis_relay_core::{
    ChannelHooks, ChannelId, RelayError, ResilientUpstreamClient, Sink, SinkError,
};
use tenvis_relay_transport::Connector;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// A payload read from a channel's upstream.
pub type Publication = (ChannelId, Bytes);

/// Sink that tags payloads with their channel.
struct ChannelSink {
    channel: ChannelId,
    publish_tx: mpsc::UnboundedSender<Publication>,
}

#[async_trait]
impl Sink for ChannelSink {
    async fn push(&self, data: Bytes) -> Result<(), SinkError> {
        self.publish_tx
            .send((self.channel.clone(), data))
            .map_err(|_| {
                metrics::record_sink_error(&self.channel);
                SinkError::Unavailable("publish queue closed".into())
            })
    }
}

/// Upstream clients keyed by channel.
pub struct UpstreamPool {
    upstream: UpstreamSection,
    allow: HashSet<String>,
    connector: Arc<dyn Connector>,
    publish_tx: mpsc::UnboundedSender<Publication>,
    clients: DashMap<ChannelId, Arc<ResilientUpstreamClient>>,
}

impl UpstreamPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        publish_tx: mpsc::UnboundedSender<Publication>,
    ) -> Self {
        if !config.upstream.is_enabled() {
            warn!("No upstream URL configured; channels will stay silent");
        }
        Self {
            upstream: config.upstream.clone(),
            allow: config.channels.allow.iter().cloned().collect(),
            connector,
            publish_tx,
            clients: DashMap::new(),
        }
    }

    /// Number of running upstream clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check whether no upstream client is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Check whether `channel` has a running upstream client.
    #[must_use]
    pub fn contains(&self, channel: &str) -> bool {
        self.clients.contains_key(channel)
    }

    /// True when every running upstream is connected.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.clients.iter().all(|client| client.value().is_ready())
    }

    /// Channels whose upstream is not connected right now, sorted.
    #[must_use]
    pub fn pending(&self) -> Vec<ChannelId> {
        let mut pending: Vec<ChannelId> = self
            .clients
            .iter()
            .filter(|client| !client.value().is_ready())
            .map(|client| client.key().clone())
            .collect();
        pending.sort();
        pending
    }

    /// Shut down every upstream client.
    pub async fn shutdown_all(&self) {
        let channels: Vec<ChannelId> = self.clients.iter().map(|c| c.key().clone()).collect();
        for channel in channels {
            if let Some((_, client)) = self.clients.remove(&channel) {
                client.shutdown().await;
            }
        }
        metrics::set_active_upstreams(0);
        info!("All upstreams shut down");
    }

    fn start(&self, channel: &str) {
        let Some(config) = self.upstream.for_channel(channel) else {
            return;
        };

        let sink = Arc::new(ChannelSink {
            channel: channel.to_string(),
            publish_tx: self.publish_tx.clone(),
        });
        let pong_channel = channel.to_string();
        let client = ResilientUpstreamClient::new(config, Arc::clone(&self.connector), sink)
            .with_pong_handler(move || trace!(channel = %pong_channel, "Upstream heartbeat answered"));
        client.start();

        self.clients.insert(channel.to_string(), Arc::new(client));
        metrics::set_active_upstreams(self.clients.len());
    }
}

#[async_trait]
impl ChannelHooks for UpstreamPool {
    async fn is_valid_channel(&self, channel: &str) -> bool {
        self.allow.is_empty() || self.allow.contains(channel)
    }

    async fn on_subscribe(&self, channel: &str) {
        debug!(channel = %channel, "Channel activated");
        metrics::record_channel_activation();

        let stale = self.clients.remove(channel);
        if let Some((_, client)) = stale {
            client.shutdown().await;
        }
        self.start(channel);
    }

    async fn on_unsubscribe(&self, channel: &str) {
        debug!(channel = %channel, "Channel deactivated");

        let removed = self.clients.remove(channel);
        if let Some((_, client)) = removed {
            client.shutdown().await;
        }
        metrics::set_active_upstreams(self.clients.len());
    }

    fn on_error(&self, error: &RelayError) {
        metrics::record_error("relay");
        warn!(error = %error, "Relay error");
    }
}
