use std::net::SocketAddr;

use crate::sql::Command;

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (`created` or error label).
pub const RESERVATIONS_TOTAL: &str = "slotbook_reservations_total";

/// Counter: applied lifecycle transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "slotbook_transitions_total";

/// Counter: bookings closed by the deposit sweeper. Labels: to.
pub const SWEEP_CLOSED_TOTAL: &str = "slotbook_sweep_closed_total";

/// Counter: payment notifications processed. Labels: outcome.
pub const RECONCILIATIONS_TOTAL: &str = "slotbook_reconciliations_total";

/// Counter: payment links issued.
pub const PAYMENT_LINKS_TOTAL: &str = "slotbook_payment_links_total";

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label of a command for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Reserve { .. } => "reserve",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::StartPayment { .. } => "start_payment",
        Command::PaymentNotification { .. } => "payment_notification",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectOccupiedSlots { .. } => "select_occupied_slots",
        Command::SelectBookingStats { .. } => "select_booking_stats",
    }
}
