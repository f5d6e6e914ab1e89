//! Caller-supplied channel hooks.

use async_trait::async_trait;
use tracing::warn;

use crate::error::RelayError;

/// Hooks a [`ChannelBroadcastServer`](crate::ChannelBroadcastServer) calls
/// around channel membership.
///
/// `on_subscribe` and `on_unsubscribe` run on a single dispatcher task in the
/// order the transitions happened, so a slow hook delays the ones queued after
/// it. Spawn long-running work instead of awaiting it here.
#[async_trait]
pub trait ChannelHooks: Send + Sync + 'static {
    /// Decide whether `channel` may be subscribed to.
    async fn is_valid_channel(&self, _channel: &str) -> bool {
        true
    }

    /// A channel went from zero subscribers to one.
    async fn on_subscribe(&self, _channel: &str) {}

    /// A channel went from one subscriber to zero.
    async fn on_unsubscribe(&self, _channel: &str) {}

    /// Best-effort diagnostics. Must not panic.
    fn on_error(&self, error: &RelayError) {
        warn!(error = %error, "Relay error");
    }
}

/// Hooks that accept every channel and do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ChannelHooks for NoopHooks {}
