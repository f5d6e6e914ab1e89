//! Prometheus metrics for the relay.
//!
//! Three groups: downstream sessions and their control traffic, channel
//! fan-out of upstream payloads, and the per-channel upstream clients.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_OPENED_TOTAL: &str = "relay_sessions_opened_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const SESSION_DURATION_SECONDS: &str = "relay_session_duration_seconds";
    pub const SESSION_REJECTIONS_TOTAL: &str = "relay_session_rejections_total";
    pub const CONTROL_FRAMES_TOTAL: &str = "relay_control_frames_total";
    pub const CONTROL_FRAME_BYTES_TOTAL: &str = "relay_control_frame_bytes_total";
    pub const FRAMES_DELIVERED_TOTAL: &str = "relay_frames_delivered_total";
    pub const PUBLICATIONS_TOTAL: &str = "relay_publications_total";
    pub const PUBLICATION_BYTES_TOTAL: &str = "relay_publication_bytes_total";
    pub const PUBLICATIONS_UNROUTED_TOTAL: &str = "relay_publications_unrouted_total";
    pub const FANOUT_RECIPIENTS: &str = "relay_fanout_recipients";
    pub const CHANNELS_ACTIVE: &str = "relay_channels_active";
    pub const CHANNEL_ACTIVATIONS_TOTAL: &str = "relay_channel_activations_total";
    pub const UPSTREAMS_ACTIVE: &str = "relay_upstreams_active";
    pub const UPSTREAMS_PENDING: &str = "relay_upstreams_pending";
    pub const UPSTREAM_SINK_ERRORS_TOTAL: &str = "relay_upstream_sink_errors_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";

    /// Every name above.
    pub const ALL: [&str; 17] = [
        SESSIONS_OPENED_TOTAL,
        SESSIONS_ACTIVE,
        SESSION_DURATION_SECONDS,
        SESSION_REJECTIONS_TOTAL,
        CONTROL_FRAMES_TOTAL,
        CONTROL_FRAME_BYTES_TOTAL,
        FRAMES_DELIVERED_TOTAL,
        PUBLICATIONS_TOTAL,
        PUBLICATION_BYTES_TOTAL,
        PUBLICATIONS_UNROUTED_TOTAL,
        FANOUT_RECIPIENTS,
        CHANNELS_ACTIVE,
        CHANNEL_ACTIVATIONS_TOTAL,
        UPSTREAMS_ACTIVE,
        UPSTREAMS_PENDING,
        UPSTREAM_SINK_ERRORS_TOTAL,
        ERRORS_TOTAL,
    ];
}

/// Register descriptions for every relay metric.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_OPENED_TOTAL,
        "Downstream WebSocket sessions accepted"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Downstream sessions currently open");
    metrics::describe_histogram!(
        names::SESSION_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "How long downstream sessions stayed open"
    );
    metrics::describe_counter!(
        names::SESSION_REJECTIONS_TOTAL,
        "Upgrade requests turned away, by reason"
    );
    metrics::describe_counter!(
        names::CONTROL_FRAMES_TOTAL,
        "Subscribe, unsubscribe and ping frames received from clients"
    );
    metrics::describe_counter!(
        names::CONTROL_FRAME_BYTES_TOTAL,
        metrics::Unit::Bytes,
        "Size of client control frames"
    );
    metrics::describe_counter!(
        names::FRAMES_DELIVERED_TOTAL,
        "Frames written to client sockets, replies and channel payloads alike"
    );
    metrics::describe_counter!(
        names::PUBLICATIONS_TOTAL,
        "Upstream payloads handed to channel fan-out"
    );
    metrics::describe_counter!(
        names::PUBLICATION_BYTES_TOTAL,
        metrics::Unit::Bytes,
        "Raw size of upstream payloads before wrapping"
    );
    metrics::describe_counter!(
        names::PUBLICATIONS_UNROUTED_TOTAL,
        "Upstream payloads that arrived after their channel lost its last subscriber"
    );
    metrics::describe_histogram!(
        names::FANOUT_RECIPIENTS,
        "Subscribers one upstream payload was queued to"
    );
    metrics::describe_gauge!(
        names::CHANNELS_ACTIVE,
        "Channels with at least one subscriber"
    );
    metrics::describe_counter!(
        names::CHANNEL_ACTIVATIONS_TOTAL,
        "Channels that went from zero subscribers to one"
    );
    metrics::describe_gauge!(
        names::UPSTREAMS_ACTIVE,
        "Upstream clients running, one per active channel"
    );
    metrics::describe_gauge!(
        names::UPSTREAMS_PENDING,
        "Upstream clients not subscribed upstream yet, as of the last readiness probe"
    );
    metrics::describe_counter!(
        names::UPSTREAM_SINK_ERRORS_TOTAL,
        "Upstream payloads the publish queue refused, by channel"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Non-fatal relay errors, by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an upgrade request that was refused.
pub fn record_rejection(reason: &'static str) {
    counter!(names::SESSION_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record a frame written to a client socket.
pub fn record_delivery() {
    counter!(names::FRAMES_DELIVERED_TOTAL).increment(1);
}

/// Record one upstream payload and how far it fanned out.
pub fn record_publication(bytes: usize, recipients: usize) {
    counter!(names::PUBLICATIONS_TOTAL).increment(1);
    counter!(names::PUBLICATION_BYTES_TOTAL).increment(bytes as u64);
    histogram!(names::FANOUT_RECIPIENTS).record(recipients as f64);
    if recipients == 0 {
        counter!(names::PUBLICATIONS_UNROUTED_TOTAL).increment(1);
    }
}

/// Record a channel gaining its first subscriber.
pub fn record_channel_activation() {
    counter!(names::CHANNEL_ACTIVATIONS_TOTAL).increment(1);
}

/// Update the active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Update the upstream client count.
pub fn set_active_upstreams(count: usize) {
    gauge!(names::UPSTREAMS_ACTIVE).set(count as f64);
}

/// Update the count of upstreams still waiting on their handshake.
pub fn set_pending_upstreams(count: usize) {
    gauge!(names::UPSTREAMS_PENDING).set(count as f64);
}

/// Record a payload the publish queue refused.
pub fn record_sink_error(channel: &str) {
    counter!(names::UPSTREAM_SINK_ERRORS_TOTAL, "channel" => channel.to_string()).increment(1);
}

/// Record a non-fatal error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Metrics for one downstream session.
///
/// Opening counts the session; dropping it records how long it lasted and
/// how many control frames it sent.
pub struct SessionMetrics {
    opened_at: Instant,
    control_frames: u64,
}

impl SessionMetrics {
    /// Count a newly accepted session.
    #[must_use]
    pub fn open() -> Self {
        counter!(names::SESSIONS_OPENED_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self {
            opened_at: Instant::now(),
            control_frames: 0,
        }
    }

    /// Record a control frame received on this session.
    pub fn control_frame(&mut self, bytes: usize) {
        self.control_frames += 1;
        counter!(names::CONTROL_FRAMES_TOTAL).increment(1);
        counter!(names::CONTROL_FRAME_BYTES_TOTAL).increment(bytes as u64);
    }

    /// Control frames seen so far.
    #[must_use]
    pub fn control_frames(&self) -> u64 {
        self.control_frames
    }
}

impl Drop for SessionMetrics {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
        histogram!(names::SESSION_DURATION_SECONDS).record(self.opened_at.elapsed().as_secs_f64());
        tracing::trace!(control_frames = self.control_frames, "Session metrics closed");
    }
}
