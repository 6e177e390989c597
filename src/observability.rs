use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total API requests served. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "parkd_requests_total";

/// Histogram: request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "parkd_request_duration_seconds";

/// Counter: bookings created (holds taken).
pub const BOOKINGS_CREATED_TOTAL: &str = "parkd_bookings_created_total";

/// Counter: payments verified (settlements).
pub const PAYMENTS_VERIFIED_TOTAL: &str = "parkd_payments_verified_total";

/// Counter: gateway verification rejections.
pub const PAYMENT_FAILURES_TOTAL: &str = "parkd_payment_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: holds released by the expiry sweep.
pub const HOLDS_EXPIRED_TOTAL: &str = "parkd_holds_expired_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if port
/// is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
