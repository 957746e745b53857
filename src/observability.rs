use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire commands handled. Labels: op, status.
pub const COMMANDS_TOTAL: &str = "holdfast_commands_total";

/// Histogram: wire command latency in seconds. Labels: op.
pub const COMMAND_DURATION_SECONDS: &str = "holdfast_command_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: rental state transitions. Labels: transition.
pub const RESERVATIONS_TOTAL: &str = "holdfast_reservations_total";

/// Counter: temporary block activity. Labels: action (placed, finalized, removed, reaped).
pub const HOLDS_TOTAL: &str = "holdfast_holds_total";

/// Counter: writes rejected because the range was taken.
pub const CONFLICTS_TOTAL: &str = "holdfast_conflicts_total";

/// Histogram: reaper sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "holdfast_sweep_duration_seconds";

/// Counter: payment provider calls retried. Labels: op.
pub const PAYMENT_RETRIES_TOTAL: &str = "holdfast_payment_retries_total";

/// Counter: notifications handed to the sink. Labels: status.
pub const NOTIFICATIONS_TOTAL: &str = "holdfast_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "holdfast_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "holdfast_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "holdfast_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "holdfast_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "holdfast_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}
