//! # Parley Server
//!
//! Room-based message relay with durable history and broker-backed
//! fan-out.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//! ```
//!
//! Configuration is read from `parley.toml` when present; see
//! [`config::Config`].

mod config;
mod gateway;
mod metrics;

use anyhow::Result;
use parley_core::{AmqpBroker, BrokerSettings, JwtVerifier, MongoStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Parley relay on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(err) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", err);
        }
    }

    // Durable store
    let store = Arc::new(MongoStore::connect(&config.store.uri, &config.store.database).await?);

    // Broker adapter: one connection and one channel for the whole
    // process, supervised by the reconnect watchdog.
    let broker = AmqpBroker::connect(BrokerSettings {
        url: config.broker.url.clone(),
        exchange: config.broker.exchange.clone(),
        reconnect_interval: Duration::from_millis(config.broker.reconnect_interval_ms),
    })
    .await?;
    let _watchdog = broker.spawn_watchdog();

    let verifier = Arc::new(JwtVerifier::new(&config.auth.jwt_secret));

    // Serve until shutdown is signalled
    gateway::run_server(config, verifier, store, broker.clone()).await?;

    broker.shutdown().await;

    Ok(())
}
