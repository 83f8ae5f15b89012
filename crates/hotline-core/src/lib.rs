//! # hotline-core
//!
//! Shared types for the hotline call broker:
//!
//! - [`protocol`]: command tags, error codes, and the JSON request/reply
//!   shapes exchanged with staffer and user clients
//! - [`ids`]: branded identifiers for connections and sessions
//! - [`errors`]: protocol decode errors
//!
//! This crate performs no I/O.

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::ProtocolError;
pub use ids::{ConnectionId, SessionId};
pub use protocol::{Command, ErrorCode, IceServer};
