// Prometheus metrics for the proxying engine

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static::lazy_static! {
    // Request counters
    pub static ref PROXY_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sidegate_requests_total",
        "Total number of proxied requests",
        &["method", "status"]
    ).unwrap();

    pub static ref PROXY_REQUEST_ERRORS: IntCounterVec = register_int_counter_vec!(
        "sidegate_request_errors_total",
        "Total number of failed exchanges by error kind",
        &["error_type"]
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "sidegate_request_duration_seconds",
        "Exchange duration from request header to end of response",
        &["method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).unwrap();

    // Connection pool
    pub static ref POOL_ACQUIRES: IntCounterVec = register_int_counter_vec!(
        "sidegate_pool_acquires_total",
        "Pool acquisitions by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref POOL_DISPOSALS: IntCounterVec = register_int_counter_vec!(
        "sidegate_pool_disposals_total",
        "Pooled connections closed, by reason",
        &["reason"]
    ).unwrap();

    // DNS cache metrics
    pub static ref DNS_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "sidegate_dns_lookups_total",
        "DNS cache lookups by result",
        &["cache_status"]
    ).unwrap();

    // Relayed bytes
    pub static ref BYTES_RELAYED: IntCounterVec = register_int_counter_vec!(
        "sidegate_bytes_relayed_total",
        "Body and tunnel bytes relayed",
        &["direction"]
    ).unwrap();

    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "sidegate_active_sessions",
        "Client sessions currently running"
    ).unwrap();

    pub static ref ACTIVE_TUNNELS: IntGauge = register_int_gauge!(
        "sidegate_active_tunnels",
        "CONNECT tunnels currently open"
    ).unwrap();
}

/// Helper struct for recording proxy metrics
pub struct HttpMetrics;

impl HttpMetrics {
    /// Record a completed exchange
    pub fn record_request(method: &str, status: u16, duration_secs: f64) {
        PROXY_REQUESTS_TOTAL
            .with_label_values(&[method, &status.to_string()])
            .inc();
        REQUEST_DURATION
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    pub fn record_error(error_type: &str) {
        PROXY_REQUEST_ERRORS.with_label_values(&[error_type]).inc();
    }

    /// `outcome` is one of `reused`, `new`, `unlimited`, `no_capacity`
    pub fn record_acquire(outcome: &str) {
        POOL_ACQUIRES.with_label_values(&[outcome]).inc();
    }

    pub fn record_disposal(reason: &str) {
        POOL_DISPOSALS.with_label_values(&[reason]).inc();
    }

    pub fn record_dns(hit: bool) {
        DNS_LOOKUPS
            .with_label_values(&[if hit { "hit" } else { "miss" }])
            .inc();
    }

    /// `direction` is `upstream` (client to origin) or `downstream`
    pub fn record_bytes(direction: &str, bytes: u64) {
        if bytes > 0 {
            BYTES_RELAYED.with_label_values(&[direction]).inc_by(bytes);
        }
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_exported() {
        HttpMetrics::record_request("GET", 200, 0.02);
        HttpMetrics::record_acquire("reused");
        HttpMetrics::record_bytes("downstream", 5);

        let text = gather();
        assert!(text.contains("sidegate_requests_total"));
        assert!(text.contains("sidegate_pool_acquires_total"));
        assert!(text.contains("sidegate_bytes_relayed_total"));
    }

    #[test]
    fn test_zero_bytes_not_recorded() {
        let before = BYTES_RELAYED.with_label_values(&["test-zero"]).get();
        HttpMetrics::record_bytes("test-zero", 0);
        assert_eq!(BYTES_RELAYED.with_label_values(&["test-zero"]).get(), before);
    }
}
