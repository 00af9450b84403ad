//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define relay metrics (connections, requests, latency, backend errors)
//! - Expose a Prometheus-compatible endpoint when configured
//!
//! # Metrics
//! - `relay_connections_total` (counter): accepted connections
//! - `relay_active_connections` (gauge): connections currently handled
//! - `relay_requests_total` (counter): finished exchanges by outcome, status
//! - `relay_request_duration_seconds` (histogram): end-to-end latency
//! - `relay_backend_errors_total` (counter): backend failures by kind
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are low-cardinality (`outcome`, `status`, `kind`)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

pub fn connection_opened() {
    counter!("relay_connections_total").increment(1);
    gauge!("relay_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("relay_active_connections").decrement(1.0);
}

/// Record a finished exchange. `status` is 0 when nothing was sent back.
pub fn record_request(outcome: &'static str, status: u16, start: Instant) {
    counter!("relay_requests_total", "outcome" => outcome, "status" => status.to_string()).increment(1);
    histogram!("relay_request_duration_seconds", "outcome" => outcome).record(start.elapsed().as_secs_f64());
}

pub fn record_backend_error(kind: &'static str) {
    counter!("relay_backend_errors_total", "kind" => kind).increment(1);
}

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}
