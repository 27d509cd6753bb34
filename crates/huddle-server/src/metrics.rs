//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const FRAMES_TOTAL: &str = "huddle_frames_total";
    pub const FRAMES_BYTES: &str = "huddle_frames_bytes";
    pub const FRAME_LATENCY_SECONDS: &str = "huddle_frame_latency_seconds";
    pub const DECODE_ERRORS_TOTAL: &str = "huddle_decode_errors_total";
    pub const UPGRADES_REJECTED_TOTAL: &str = "huddle_upgrades_rejected_total";
    pub const TOKENS_ISSUED_TOTAL: &str = "huddle_tokens_issued_total";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
}

/// Frame direction label.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    /// Peer to router.
    Inbound,
    /// Router to peer.
    Outbound,
}

impl Direction {
    const fn label(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of peer connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open peer connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_histogram!(
        names::FRAME_LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(
        names::DECODE_ERRORS_TOTAL,
        "Inbound frames discarded because they did not decode"
    );
    metrics::describe_counter!(
        names::UPGRADES_REJECTED_TOTAL,
        "Connection upgrades refused before a session was created"
    );
    metrics::describe_counter!(names::TOKENS_ISSUED_TOTAL, "Upgrade tokens minted");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of transport errors");

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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: Direction) {
    counter!(names::FRAMES_TOTAL, "direction" => direction.label()).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction.label()).increment(bytes as u64);
}

/// Record inbound frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::FRAME_LATENCY_SECONDS).record(seconds);
}

/// Record a frame that failed to decode.
pub fn record_decode_error() {
    counter!(names::DECODE_ERRORS_TOTAL).increment(1);
}

/// Record a refused upgrade.
pub fn record_rejected_upgrade(reason: &'static str) {
    counter!(names::UPGRADES_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record a minted token.
pub fn record_token_issued() {
    counter!(names::TOKENS_ISSUED_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
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
