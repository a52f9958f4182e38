use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotmatch_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotmatch_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "slotmatch_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotmatch_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotmatch_connections_rejected_total";

/// Gauge: resources held in memory.
pub const RESOURCES_ACTIVE: &str = "slotmatch_resources_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotmatch_wal_flush_duration_seconds";

/// Histogram: records per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotmatch_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None; a
/// failed install is logged and the server runs without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://{addr}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlots { rows, .. } if rows.len() > 1 => "insert_slot_batch",
        Command::InsertSlots { .. } => "insert_slot",
        Command::InsertRecurring { .. } => "insert_recurring",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::DeleteSlots { .. } => "delete_slots",
        Command::SelectSlot { .. } => "select_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectActorSlots { .. } => "select_actor_slots",
        Command::SelectMatches { .. } => "select_matches",
        Command::SelectResourceMatches { .. } => "select_resource_matches",
    }
}
