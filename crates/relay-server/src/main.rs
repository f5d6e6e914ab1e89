//! # Relay Server
//!
//! Realtime channel relay: clients subscribe to channels over WebSocket and
//! each active channel is fed by its own resilient upstream connection.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (relay.toml if present)
//! relay
//!
//! # Run with environment overrides
//! RELAY_PORT=8080 RELAY_HOST=0.0.0.0 RELAY_UPSTREAM_URL='wss://feed.example.com/{channel}' relay
//! ```

mod config;
mod handlers;
mod metrics;
mod upstreams;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
