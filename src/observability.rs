use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "deskbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "deskbook_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: holds successfully placed (single and recurring).
pub const HOLDS_PLACED_TOTAL: &str = "deskbook_holds_placed_total";

/// Counter: hold attempts refused because the interval was taken.
pub const HOLD_CONFLICTS_TOTAL: &str = "deskbook_hold_conflicts_total";

/// Counter: holds moved to CANCELLED(EXPIRED), by the sweeper or lazily.
pub const HOLDS_EXPIRED_TOTAL: &str = "deskbook_holds_expired_total";

/// Counter: resource lock waits that hit the timeout and answered `busy`.
pub const LOCK_TIMEOUTS_TOTAL: &str = "deskbook_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "deskbook_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "deskbook_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "deskbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "deskbook_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "deskbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None; a
/// failure is logged and the server keeps running without metrics.
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

/// Short label for a request, used on the RED metrics.
pub fn op_label(request: &Request) -> &'static str {
    match request {
        Request::Slots { .. } => "slots",
        Request::Hold { .. } => "hold",
        Request::Confirm { .. } => "confirm",
        Request::Cancel { .. } => "cancel",
        Request::Recurring(_) => "recurring",
        Request::SweepExpired => "sweep_expired",
        Request::Get { .. } => "get",
        Request::List(_) => "list",
        Request::Upcoming { .. } => "upcoming",
        Request::History { .. } => "history",
        Request::Update { .. } => "update",
        Request::Series { .. } => "series",
        Request::CancelSeries { .. } => "cancel_series",
        Request::UpdateSeries { .. } => "update_series",
        Request::DetachMember { .. } => "detach_member",
        Request::Complete { .. } => "complete",
        Request::NoShow { .. } => "no_show",
        Request::RegisterResource(_) => "register_resource",
        Request::UpdateResource(_) => "update_resource",
        Request::SetActive { .. } => "set_active",
        Request::Resources => "resources",
        Request::AddWindow(_) => "add_window",
        Request::RemoveWindow { .. } => "remove_window",
        Request::Windows { .. } => "windows",
        Request::Watch { .. } => "watch",
        Request::Unwatch { .. } => "unwatch",
    }
}
