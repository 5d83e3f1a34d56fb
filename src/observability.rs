use std::net::SocketAddr;

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: reconciliation passes. Labels: outcome (completed, failed, skipped).
pub const PASSES_TOTAL: &str = "courtwatch_passes_total";

/// Histogram: pass duration in seconds.
pub const PASS_DURATION_SECONDS: &str = "courtwatch_pass_duration_seconds";

/// Counter: facility passes abandoned. Labels: kind (fetch, persistence).
pub const FACILITY_FAILURES_TOTAL: &str = "courtwatch_facility_failures_total";

/// Counter: timeslots that opened.
pub const TIMESLOTS_OPENED_TOTAL: &str = "courtwatch_timeslots_opened_total";

/// Counter: timeslots that closed.
pub const TIMESLOTS_CLOSED_TOTAL: &str = "courtwatch_timeslots_closed_total";

// ── Notifications ───────────────────────────────────────────────

/// Counter: channel call failures. Labels: op (post, retract).
pub const NOTIFICATION_FAILURES_TOTAL: &str = "courtwatch_notification_failures_total";

/// Counter: retraction tasks run. Labels: outcome (deleted, absent, failed).
pub const RETRACTIONS_TOTAL: &str = "courtwatch_retractions_total";

/// Gauge: retraction tasks waiting for their delay.
pub const RETRACTIONS_PENDING: &str = "courtwatch_retractions_pending";

// ── Store ───────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtwatch_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtwatch_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn set_gauge(name: &'static str, value: usize) {
    metrics::gauge!(name).set(value as f64);
}
