//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "relay_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const FRAMES_TOTAL: &str = "relay_frames_total";
    pub const FRAMES_BYTES: &str = "relay_frames_bytes";
    pub const BROADCAST_RECIPIENTS: &str = "relay_broadcast_recipients";
    pub const DESTINATIONS_ACTIVE: &str = "relay_destinations_active";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of STOMP sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of open sessions");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by command");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames sent to clients");
    metrics::describe_histogram!(
        names::BROADCAST_RECIPIENTS,
        "Number of subscribers reached per broadcast"
    );
    metrics::describe_gauge!(names::DESTINATIONS_ACTIVE, "Current number of destinations");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

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

/// Record a frame received from a client.
pub fn record_inbound(command: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => "inbound", "command" => command).increment(1);
}

/// Record a frame written to a client by the session loop.
pub fn record_outbound(command: &'static str, bytes: usize) {
    counter!(names::FRAMES_TOTAL, "direction" => "outbound", "command" => command).increment(1);
    counter!(names::FRAMES_BYTES).increment(bytes as u64);
}

/// Record the fan-out of one broadcast.
pub fn record_broadcast(recipients: usize) {
    histogram!(names::BROADCAST_RECIPIENTS).record(recipients as f64);
}

/// Update the destination count.
pub fn set_active_destinations(count: usize) {
    gauge!(names::DESTINATIONS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records the session's end on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session start.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder is installed; every call must be a no-op.
        let _guard = SessionMetricsGuard::new();
        record_inbound("SEND");
        record_outbound("MESSAGE", 42);
        record_broadcast(3);
        set_active_destinations(1);
        record_error("protocol");
    }
}
