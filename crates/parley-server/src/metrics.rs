//! Prometheus metrics for the relay.
//!
//! Instrumentation goes through the `metrics` facade; the exporter
//! serves the scrape endpoint on its own port. The broker reconnect
//! counter is emitted from the adapter's watchdog task in the core
//! crate through the same facade.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const MESSAGES_BYTES: &str = "parley_messages_bytes";
    pub const SUBSCRIPTIONS_TOTAL: &str = "parley_subscriptions_total";
    pub const LATENCY_SECONDS: &str = "parley_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
    pub const BROKER_RECONNECTS_TOTAL: &str = "parley_broker_reconnects_total";
}

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Connections accepted since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Currently open connections");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Frames processed, by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Frame bytes processed, by direction");
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Room subscriptions opened");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors surfaced to clients, by kind");
    metrics::describe_counter!(
        names::BROKER_RECONNECTS_TOTAL,
        "Broker links re-established by the reconnect watchdog"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus scrape endpoint.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind or install.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a closed connection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame in either direction.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record inbound frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a room subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record a client-visible error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Guard tying the active-connection gauge to a connection's lifetime.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Record the connection; the matching disconnect is recorded on drop.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Recording without an installed recorder must not panic.
        let _guard = ConnectionMetricsGuard::new();
        record_message(64, "inbound");
        record_error("protocol");
    }
}
