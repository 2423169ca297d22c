use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total API requests handled. Labels: operation, status.
pub const REQUESTS_TOTAL: &str = "chairside_requests_total";

/// Histogram: API request latency in seconds. Labels: operation.
pub const REQUEST_DURATION_SECONDS: &str = "chairside_request_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: bookings or edits rejected by a conflict rule. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "chairside_conflicts_total";

/// Counter: appointments booked. Labels: source (staff, patient).
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "chairside_appointments_booked_total";

/// Counter: reminder events published by the sweeper.
pub const REMINDERS_SENT_TOTAL: &str = "chairside_reminders_sent_total";

/// Counter: notification sink deliveries that failed. Labels: sink.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "chairside_notification_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: clinics with a loaded engine.
pub const CLINICS_ACTIVE: &str = "chairside_clinics_active";

/// Counter: requests rejected for missing or bad caller identity.
pub const AUTH_FAILURES_TOTAL: &str = "chairside_auth_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "chairside_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "chairside_journal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record one finished API call.
pub fn record_request(operation: &'static str, status: &'static str, started: std::time::Instant) {
    metrics::counter!(REQUESTS_TOTAL, "operation" => operation, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}
