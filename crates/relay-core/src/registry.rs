//! Channel membership registry.
//!
//! The registry keeps two indexes in step: connection → subscribed channels
//! and channel → subscribed connections. A channel is present only while it
//! has at least one subscriber.
//!
//! Locks are always taken connection entry first, channel entry second. The
//! 0→1 and 1→0 checks run while the channel entry is held, and the transition
//! callback is invoked under that same lock, so two callers can never both see
//! themselves as the first subscriber or the last one out.

use crate::channel::ChannelId;
use crate::connection::ConnectionHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tenvis_relay_transport::{ConnectionId, TransportError};
use tracing::{debug, trace};

/// Result of adding a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Subscription recorded; `activated` is set on the channel's 0→1 transition.
    Subscribed {
        /// Whether this was the channel's first subscriber.
        activated: bool,
    },
    /// The connection was already subscribed.
    AlreadySubscribed,
    /// The connection is not registered (never connected or already gone).
    UnknownConnection,
}

/// Per-connection record.
struct ConnectionEntry {
    handle: ConnectionHandle,
    channels: HashSet<ChannelId>,
}

/// The connection and channel indexes.
#[derive(Default)]
pub struct ChannelRegistry {
    /// Subscribers indexed by channel name.
    channels: DashMap<ChannelId, HashMap<ConnectionId, ConnectionHandle>>,
    /// Connection records (connection_id -> handle and channel names).
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with an empty subscription set.
    ///
    /// Returns `false` if a connection with the same id is already registered.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        match self.connections.entry(handle.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                trace!(connection = %handle.id(), "Registered connection");
                slot.insert(ConnectionEntry {
                    handle,
                    channels: HashSet::new(),
                });
                true
            }
        }
    }

    /// Check whether a connection is registered.
    #[must_use]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Check whether a connection is subscribed to a channel.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId, channel: &str) -> bool {
        self.connections
            .get(connection_id)
            .map(|c| c.channels.contains(channel))
            .unwrap_or(false)
    }

    /// Number of channels a connection is subscribed to.
    #[must_use]
    pub fn subscription_count(&self, connection_id: &ConnectionId) -> usize {
        self.connections
            .get(connection_id)
            .map(|c| c.channels.len())
            .unwrap_or(0)
    }

    /// Subscribe a connection to a channel.
    ///
    /// `on_activate` runs while the channel entry is locked, only on the
    /// channel's 0→1 transition.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        channel: &str,
        on_activate: impl FnOnce(&str),
    ) -> SubscribeOutcome {
        let Some(mut conn) = self.connections.get_mut(connection_id) else {
            return SubscribeOutcome::UnknownConnection;
        };
        if conn.channels.contains(channel) {
            return SubscribeOutcome::AlreadySubscribed;
        }

        let handle = conn.handle.clone();
        let activated = {
            let mut subscribers = self.channels.entry(channel.to_string()).or_default();
            let activated = subscribers.is_empty();
            subscribers.insert(connection_id.clone(), handle);
            if activated {
                debug!(channel = %channel, "Channel activated");
                on_activate(channel);
            }
            activated
        };
        conn.channels.insert(channel.to_string());

        debug!(
            channel = %channel,
            connection = %connection_id,
            subscriptions = conn.channels.len(),
            "Subscribed"
        );

        SubscribeOutcome::Subscribed { activated }
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `false` if it was not subscribed. `on_deactivate` runs while the
    /// channel entry is locked, only on the channel's 1→0 transition.
    pub fn unsubscribe(
        &self,
        connection_id: &ConnectionId,
        channel: &str,
        on_deactivate: impl FnOnce(&str),
    ) -> bool {
        let Some(mut conn) = self.connections.get_mut(connection_id) else {
            return false;
        };
        if !conn.channels.remove(channel) {
            return false;
        }

        self.detach(connection_id, channel, on_deactivate);
        debug!(channel = %channel, connection = %connection_id, "Unsubscribed");
        true
    }

    /// Drop a connection, leaving every channel it was subscribed to.
    ///
    /// `on_deactivate` runs for each channel this empties. Returns the handle
    /// and the channels it left, or `None` if the connection was unknown.
    pub fn remove_connection(
        &self,
        connection_id: &ConnectionId,
        mut on_deactivate: impl FnMut(&str),
    ) -> Option<(ConnectionHandle, Vec<ChannelId>)> {
        let (_, entry) = self.connections.remove(connection_id)?;

        let mut left = Vec::with_capacity(entry.channels.len());
        for channel in entry.channels {
            self.detach(connection_id, &channel, &mut on_deactivate);
            left.push(channel);
        }

        debug!(connection = %connection_id, channels = left.len(), "Removed connection");
        Some((entry.handle, left))
    }

    /// Remove a connection from a channel's subscriber set, deleting the
    /// channel when it empties.
    fn detach(&self, connection_id: &ConnectionId, channel: &str, on_deactivate: impl FnOnce(&str)) {
        if let Entry::Occupied(mut subscribers) = self.channels.entry(channel.to_string()) {
            subscribers.get_mut().remove(connection_id);
            if subscribers.get().is_empty() {
                subscribers.remove();
                debug!(channel = %channel, "Channel deactivated");
                on_deactivate(channel);
            }
        }
    }

    /// Queue `payload` for every open subscriber of `channel`.
    ///
    /// Closed subscribers are skipped. Send failures are passed to `on_failure`
    /// and do not stop delivery to the rest. Returns the number of connections
    /// the payload was queued to.
    pub fn broadcast(
        &self,
        channel: &str,
        payload: &Arc<str>,
        mut on_failure: impl FnMut(&ConnectionId, TransportError),
    ) -> usize {
        let Some(subscribers) = self.channels.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for (connection_id, handle) in subscribers.iter() {
            if !handle.is_open() {
                trace!(channel = %channel, connection = %connection_id, "Skipping closed subscriber");
                continue;
            }
            match handle.send(Arc::clone(payload)) {
                Ok(()) => delivered += 1,
                Err(e) => on_failure(connection_id, e),
            }
        }
        delivered
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Names of all channels with at least one subscriber, sorted.
    #[must_use]
    pub fn active_channels(&self) -> Vec<ChannelId> {
        let mut names: Vec<ChannelId> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Channels a connection is subscribed to, sorted.
    #[must_use]
    pub fn connection_channels(&self, connection_id: &ConnectionId) -> Vec<ChannelId> {
        let mut names: Vec<ChannelId> = self
            .connections
            .get(connection_id)
            .map(|c| c.channels.iter().cloned().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// Handles of every registered connection.
    #[must_use]
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|c| c.handle.clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.channels.len(),
            connection_count: self.connections.len(),
            total_subscriptions: self.connections.iter().map(|c| c.channels.len()).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of connected clients.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}
