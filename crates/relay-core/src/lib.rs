//! # relay-core
//!
//! Channel broadcast server and resilient upstream client for Relay.
//!
//! This crate provides the two halves of a relay:
//!
//! - **ChannelBroadcastServer** - downstream subscriptions, fan-out and
//!   per-channel activation hooks
//! - **ResilientUpstreamClient** - one long-lived upstream subscription that
//!   survives reconnects and forwards everything into a [`Sink`]
//! - **UpstreamMachine** - the reconnect rules, free of I/O
//! - **Backoff** - exponential reconnect delays with a cap
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │  Upstream   │────▶│ ResilientUpstream│────▶│    Sink     │
//! │   source    │     │      Client      │     └──────┬──────┘
//! └─────────────┘     └──────────────────┘            │
//!                              ▲                      ▼
//!                     on_subscribe /         ┌──────────────────┐     ┌─────────────┐
//!                     on_unsubscribe ────────│ ChannelBroadcast │────▶│ Connections │
//!                                            │      Server      │     └─────────────┘
//!                                            └──────────────────┘
//! ```

pub mod backoff;
pub mod channel;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod machine;
pub mod registry;
pub mod server;
pub mod sink;
pub mod upstream;

pub use backoff::Backoff;
pub use channel::{validate_channel_name, ChannelId};
pub use connection::{ConnectionHandle, Outgoing};
pub use error::{RelayError, SinkError};
pub use hooks::{ChannelHooks, NoopHooks};
pub use machine::{UpstreamAction, UpstreamMachine, UpstreamState};
pub use registry::RegistryStats;
pub use server::{ChannelBroadcastServer, ServerConfig, SubscriptionResult};
pub use sink::Sink;
pub use upstream::{ResilientUpstreamClient, SubscriptionMessage, UpstreamConfig};
