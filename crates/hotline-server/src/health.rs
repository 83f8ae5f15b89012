//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

use crate::directory::DirectoryStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
    /// Logged-in staffers.
    pub staffers: usize,
    /// Logged-in users.
    pub users: usize,
    /// Live sessions.
    pub sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, stats: DirectoryStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        staffers: stats.staffers,
        users: stats.users,
        sessions: stats.sessions,
    }
}
