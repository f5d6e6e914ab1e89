//! # relay-transport
//!
//! Transport abstraction layer for the Relay upstream client.
//!
//! This crate provides a unified interface for opening outbound links:
//!
//! - **WebSocket** - tokio-tungstenite client (`wss://` with the `tls` feature)
//! - **Memory** - scripted in-process links for tests and local wiring
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Connector` and `Link` traits, allowing the
//! upstream client to be protocol-agnostic.
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{Connector, Link, TransportError};
//!
//! async fn pump(connector: &dyn Connector) -> Result<(), TransportError> {
//!     let mut link = connector.connect("ws://127.0.0.1:9000").await?;
//!     while let Some(msg) = link.recv().await? {
//!         // Forward msg
//!     }
//!     Ok(())
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, Connector, Inbound, Link, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
