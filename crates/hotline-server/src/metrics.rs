//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the global Prometheus recorder.
///
/// Returns the handle that renders `/metrics`. Call once at startup, before
/// anything is recorded. A second install fails with [`ServerError::Metrics`].
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections torn down (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused because the connection limit was reached (counter).
pub const WS_CONNECTIONS_REFUSED_TOTAL: &str = "ws_connections_refused_total";
/// Frames dropped on a full outbound buffer (counter).
pub const OUTBOUND_DROPS_TOTAL: &str = "outbound_drops_total";
/// Inbound frames processed by the dispatcher (counter, labels: cmd).
pub const FRAMES_DISPATCHED_TOTAL: &str = "frames_dispatched_total";
/// Inbound frames discarded as malformed or unknown (counter).
pub const FRAMES_DISCARDED_TOTAL: &str = "frames_discarded_total";
/// Requests answered with a non-success code (counter, labels: code).
pub const REQUESTS_REJECTED_TOTAL: &str = "requests_rejected_total";
/// Sessions created (counter).
pub const SESSIONS_BEGUN_TOTAL: &str = "sessions_begun_total";
/// Sessions torn down (counter, labels: reason).
pub const SESSIONS_ENDED_TOTAL: &str = "sessions_ended_total";
/// Logged-in staffers (gauge).
pub const STAFFERS_ONLINE: &str = "staffers_online";
/// Logged-in users (gauge).
pub const USERS_ONLINE: &str = "users_online";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
