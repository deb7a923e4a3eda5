use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwire_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwire_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwire_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwire_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwire_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotwire_tenants_active";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "slotwire_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "slotwire_journal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterUser { .. } => "register_user",
        Command::SetWeekly { .. } => "set_weekly",
        Command::ClearWeekly { .. } => "clear_weekly",
        Command::SetBlockedDates { .. } => "set_blocked_dates",
        Command::ClearBlockedDates { .. } => "clear_blocked_dates",
        Command::SetDateSlots { .. } => "set_date_slots",
        Command::RemoveDateSlots { .. } => "remove_date_slots",
        Command::RequestBooking { .. } => "request_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::EditSlotMessage { .. } => "edit_slot_message",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectExperts { .. } => "select_experts",
        Command::SelectWeekly { .. } => "select_weekly",
        Command::SelectBlockedDates { .. } => "select_blocked_dates",
        Command::SelectBookingsForUser { .. } => "select_bookings_for_user",
        Command::SelectBookingsForExpert { .. } => "select_bookings_for_expert",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
