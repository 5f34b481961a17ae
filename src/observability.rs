use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reserva_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reserva_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

pub const BOOKINGS_CONFIRMED_TOTAL: &str = "reserva_bookings_confirmed_total";

/// Counter: commits that lost the race for their slot.
pub const BOOKING_CONFLICTS_TOTAL: &str = "reserva_booking_conflicts_total";

/// Counter: commits refused before reaching the store. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "reserva_bookings_rejected_total";

pub const SCHEDULE_REPLACEMENTS_TOTAL: &str = "reserva_schedule_replacements_total";

/// Counter: schedule replaces that deleted the old rules but failed to write the new.
pub const SCHEDULE_GAPS_TOTAL: &str = "reserva_schedule_gaps_total";

// ── Connections and WAL ──────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reserva_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reserva_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reserva_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reserva_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reserva_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProfile { .. } => "insert_profile",
        Command::InsertBusiness { .. } => "insert_business",
        Command::SelectBusinesses { .. } => "select_businesses",
        Command::ReplaceSchedule { .. } => "replace_schedule",
        Command::ClearSchedule { .. } => "clear_schedule",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCalendar { .. } => "select_calendar",
    }
}
