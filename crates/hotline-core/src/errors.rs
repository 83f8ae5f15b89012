//! Protocol error types.

use thiserror::Error;

/// Failure to interpret an inbound frame.
///
/// These never produce a reply to the client; the dispatcher logs and drops
/// the offending frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON or did not match the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The `cmd` tag is not one the broker accepts from clients.
    #[error("unrecognized command tag: {0}")]
    UnknownCommand(String),
    /// A numeric error code outside the known range.
    #[error("invalid error code: {0}")]
    InvalidErrorCode(u8),
}
