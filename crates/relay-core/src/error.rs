//! Error types for the relay core.

use relay_protocol::ProtocolError;
use tenvis_relay_transport::{ConnectionId, TransportError};
use thiserror::Error;

/// Failure reported by a [`Sink`](crate::Sink).
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink refused this payload.
    #[error("Sink rejected payload: {0}")]
    Rejected(String),

    /// The sink cannot accept anything right now.
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Diagnostics passed to [`ChannelHooks::on_error`](crate::ChannelHooks::on_error).
///
/// None of these are fatal; they are reported and the relay carries on.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Sending a frame to a downstream connection failed.
    #[error("Send to {connection} failed: {source}")]
    Send {
        /// The connection that could not be reached.
        connection: ConnectionId,
        /// Underlying transport failure.
        source: TransportError,
    },

    /// Encoding a server frame failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
