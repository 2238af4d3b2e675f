//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Events published (counter, labels: `topic_kind`).
pub const EVENTS_PUBLISHED_TOTAL: &str = "relay_events_published_total";
/// Successful per-connection deliveries (counter).
pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
/// Connections evicted (counter, labels: reason).
pub const EVICTIONS_TOTAL: &str = "relay_evictions_total";
/// Connections currently registered (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Idle topics deleted by the reaper (counter).
pub const TOPICS_REAPED_TOTAL: &str = "relay_topics_reaped_total";
/// WebSocket connection duration seconds (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "relay_connection_duration_seconds";
/// Handshakes rejected (counter, labels: code).
pub const HANDSHAKE_REJECTIONS_TOTAL: &str = "relay_handshake_rejections_total";
