use std::net::SocketAddr;

// ── RED metrics (event-driven) ──────────────────────────────────

/// Counter: canonical events entering the engine.
pub const EVENTS_TOTAL: &str = "parkd_events_total";

/// Counter: transitions committed (one per actual status change).
pub const TRANSITIONS_TOTAL: &str = "parkd_transitions_total";

/// Counter: rejected events (unknown sensor, unbooked occupancy).
pub const REJECTS_TOTAL: &str = "parkd_rejects_total";

/// Counter: dropped inbound messages that never normalized.
pub const DROPPED_EVENTS_TOTAL: &str = "parkd_dropped_events_total";

/// Counter: slot write committed but linked user write failed.
pub const PARTIAL_RECONCILIATIONS_TOTAL: &str = "parkd_partial_reconciliations_total";

/// Histogram: engine apply latency in seconds.
pub const APPLY_DURATION_SECONDS: &str = "parkd_apply_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active WebSocket connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total WebSocket connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
