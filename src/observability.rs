use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: action, status.
pub const REQUESTS_TOTAL: &str = "rota_requests_total";

/// Histogram: request latency in seconds. Labels: action.
pub const REQUEST_DURATION_SECONDS: &str = "rota_request_duration_seconds";

/// Counter: conflicts reported back to callers.
pub const CONFLICTS_DETECTED_TOTAL: &str = "rota_conflicts_detected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rota_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rota_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rota_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rota_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rota_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn action_label(req: &Request) -> &'static str {
    match req {
        Request::Create { .. } => "create",
        Request::Update { .. } => "update",
        Request::Delete { .. } => "delete",
        Request::List { .. } => "list",
        Request::Detail { .. } => "detail",
        Request::Watch { .. } => "watch",
    }
}
