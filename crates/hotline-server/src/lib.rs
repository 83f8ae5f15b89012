//! # hotline-server
//!
//! Call-brokering engine and its HTTP/`WebSocket` surface.
//!
//! - [`channel`]: per-connection duplex pump (reader + writer task, bounded
//!   outbound buffer, ping/pong liveness)
//! - [`manager`]: the single-consumer dispatcher that owns all routing state
//!   and applies one state transition per inbound event
//! - [`directory`]: staffer/user directories and the active session set
//! - [`routing`]: pure staffer eligibility and selection
//! - [`auth`]: optional password digests
//! - [`server`]: Axum router, `WebSocket` upgrade, `/health`, `/metrics`
//! - [`health`], [`metrics`]: health body and Prometheus metric names
//! - [`shutdown`]: cancellation-token based graceful shutdown
//!
//! ## Data Flow
//!
//! `channel` (reader task) → `manager` inbound queue → `manager` step →
//! `channel` outbound buffers → `channel` (writer task).

#![deny(unsafe_code)]

pub mod auth;
pub mod channel;
pub mod directory;
pub mod errors;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod routing;
pub mod server;
pub mod shutdown;

pub use errors::ServerError;
pub use server::{ServerHandle, start};
pub use shutdown::ShutdownCoordinator;
