//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_rate_limited_total` (counter): rejected by the rate limiter
//! - `gateway_idempotency_total` (counter): outcome = hit | conflict | stored | skipped
//! - `gateway_upstream_requests_total` (counter): forwarded requests by service, outcome
//! - `gateway_dependency_up` (gauge): 1=up, 0=down, per dependency
//!
//! # Design Decisions
//! - Macros record into whatever recorder is installed; without one they are no-ops
//! - Labels never include raw paths or identities to keep cardinality bounded

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const IDEMPOTENCY_TOTAL: &str = "gateway_idempotency_total";
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";
    pub const DEPENDENCY_UP: &str = "gateway_dependency_up";
}

/// Install the Prometheus recorder and serve it on `address`.
///
/// Must be called from within a tokio runtime.
pub fn install_exporter(address: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(address).install()?;
    tracing::info!(address = %address, "Prometheus exporter listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, duration: Duration) {
    counter!(
        names::REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_idempotency(outcome: &'static str) {
    counter!(names::IDEMPOTENCY_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_upstream(service: &str, outcome: &'static str) {
    counter!(
        names::UPSTREAM_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_dependency(name: &str, up: bool) {
    gauge!(names::DEPENDENCY_UP, "dependency" => name.to_string()).set(if up { 1.0 } else { 0.0 });
}
