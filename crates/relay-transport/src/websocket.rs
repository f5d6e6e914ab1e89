//! WebSocket transport implementation.
//!
//! This module provides the outbound WebSocket [`Connector`] using
//! tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};

use crate::traits::{Connector, Inbound, Link, TransportError};

/// Opens upstream links over WebSocket.
///
/// `wss://` URLs need the `tls` feature.
#[derive(Debug, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector.
    ///
    /// With the `tls` feature this installs the ring crypto provider as the
    /// process default unless another one is already installed.
    #[must_use]
    pub fn new() -> Self {
        #[cfg(feature = "tls")]
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(url = %url, status = %response.status(), "WebSocket handshake completed");

        Ok(Box::new(WebSocketLink::new(stream, url)))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// An outbound WebSocket link.
pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
    is_open: bool,
}

impl WebSocketLink {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, url: &str) -> Self {
        Self {
            stream,
            url: url.to_string(),
            is_open: true,
        }
    }
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        if !self.is_open {
            return Ok(None);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Inbound::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Inbound::Binary(Bytes::from(data))))
                }
                // Pongs to transport-level pings are queued by tungstenite itself.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    trace!(url = %self.url, ?frame, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!(url = %self.url, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(url = %self.url, error = %e, "WebSocket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }
}
