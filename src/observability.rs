use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking validations. Labels: outcome.
pub const VALIDATIONS_TOTAL: &str = "slotwise_validations_total";

/// Counter: commit attempts against the store. Labels: outcome.
pub const COMMITS_TOTAL: &str = "slotwise_commits_total";

/// Histogram: layout computation time in seconds.
pub const LAYOUT_DURATION_SECONDS: &str = "slotwise_layout_duration_seconds";

// ── Refresh coordinator ─────────────────────────────────────────

/// Counter: full day-view recomputes completed.
pub const RECOMPUTES_TOTAL: &str = "slotwise_recomputes_total";

/// Gauge: watched views currently stale.
pub const VIEWS_STALE: &str = "slotwise_views_stale";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
