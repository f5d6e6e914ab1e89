//! Transport abstraction traits for Relay.
//!
//! The upstream client talks to its source only through [`Connector`] and
//! [`Link`], which keeps the reconnect logic independent of any particular
//! socket implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Process-wide counter mixed into generated connection IDs.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to establish a connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A data message received over a [`Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl Inbound {
    /// The raw payload bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Inbound::Text(text) => Bytes::from(text),
            Inbound::Binary(data) => data,
        }
    }

    /// The payload as text, if it is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Inbound::Text(text) => Some(text),
            Inbound::Binary(_) => None,
        }
    }
}

/// Opens outbound links to an upstream source.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`.
    ///
    /// Resolves once the link is open and ready to carry frames.
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// An open outbound link.
///
/// `recv` must be cancel-safe: the upstream client races it against timers
/// and shutdown.
#[async_trait]
pub trait Link: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next data message.
    ///
    /// Returns `None` if the link was closed cleanly. After an error the link
    /// is considered closed.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Close the link gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}
