//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

pub use lipsync_engine::pipeline::{JOBS_TOTAL, JOB_DURATION_SECONDS, PROGRESS_FRAMES_TOTAL};

/// Install the global Prometheus recorder. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// WebSocket sessions opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "lipsync_ws_connections_total";
/// Upgrades refused at the connection cap (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "lipsync_ws_connections_rejected_total";
/// Open WebSocket sessions (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "lipsync_ws_connections_active";
/// Terminal frames sent (counter, labels: outcome).
pub const REQUESTS_TOTAL: &str = "lipsync_requests_total";
/// Time from request start to terminal frame (histogram).
pub const REQUEST_DURATION_SECONDS: &str = "lipsync_request_duration_seconds";
