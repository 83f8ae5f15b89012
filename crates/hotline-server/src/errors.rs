//! Server error types.

use std::time::Duration;

use thiserror::Error;

/// Failures starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or accepting on the listener failed.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
    /// The Prometheus recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Terminal failure of one pump task.
///
/// Pump errors only ever end the affected connection; they are logged and
/// turned into a channel-broken event, never propagated further.
#[derive(Debug, Error)]
pub enum PumpError {
    /// The transport rejected a frame.
    #[error("write failed: {0}")]
    Write(String),
    /// The peer did not drain a frame within the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    /// The transport reported a read error.
    #[error("read failed: {0}")]
    Read(String),
    /// No pong arrived within the liveness window.
    #[error("peer silent for {0:?}")]
    LivenessExpired(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let err: ServerError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use").into();
        assert!(err.to_string().contains("in use"));
    }

    #[test]
    fn pump_error_display() {
        let err = PumpError::WriteTimeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "write timed out after 10s");
        let err = PumpError::LivenessExpired(Duration::from_secs(60));
        assert_eq!(err.to_string(), "peer silent for 60s");
    }
}
