//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file only needs the keys it overrides. Example:
//!
//! ```json
//! {
//!   "server": { "port": 9443, "wsPath": "/webrtc" },
//!   "channel": { "overflow": "disconnect" },
//!   "iceServers": [{ "urls": "turn:relay.example:3478", "username": "u", "credential": "c" }]
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use hotline_core::IceServer;
use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HotlineSettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Per-connection pump settings.
    pub channel: ChannelSettings,
    /// Dispatcher queue and matching settings.
    pub dispatcher: DispatcherSettings,
    /// Relay servers handed to both parties at session begin.
    pub ice_servers: Vec<IceServer>,
    /// Optional password checks.
    pub auth: AuthSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl Default for HotlineSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            channel: ChannelSettings::default(),
            dispatcher: DispatcherSettings::default(),
            ice_servers: vec![IceServer {
                urls: "turn:43.143.227.135:3478".to_string(),
                username: "ghb".to_string(),
                credential: "moonshine".to_string(),
            }],
            auth: AuthSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks an ephemeral port).
    pub port: u16,
    /// Path of the WebSocket upgrade endpoint.
    pub ws_path: String,
    /// Upgrades beyond this many live connections are refused.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8989,
            ws_path: "/webrtc".to_string(),
            max_connections: 1024,
        }
    }
}

/// What to do when a connection's outbound buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the frame being enqueued and count it.
    #[default]
    DropNewest,
    /// Close the connection; it is then torn down like any broken channel.
    Disconnect,
}

/// Per-connection pump settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Bound of the outbound frame buffer.
    pub outbound_capacity: usize,
    /// Deadline for a single frame write, in milliseconds.
    pub write_wait_ms: u64,
    /// The peer must answer a ping within this window, in milliseconds.
    pub pong_wait_ms: u64,
    /// Ping period in milliseconds. Must be less than `pong_wait_ms`.
    pub ping_period_ms: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Behaviour when the outbound buffer is full.
    pub overflow: OverflowPolicy,
}

impl ChannelSettings {
    /// Write deadline.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Liveness deadline, refreshed on every pong.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Interval between pings.
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 1024,
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            ping_period_ms: 54_000,
            max_message_size: 1024 * 1024,
            overflow: OverflowPolicy::DropNewest,
        }
    }
}

/// Tie-break used when a call does not name a staffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// First eligible staffer in account order.
    #[default]
    LowestAccount,
    /// Eligible staffer that has been idle the longest; ties by account.
    LongestIdle,
}

/// Dispatcher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherSettings {
    /// Bound of the shared inbound queue.
    pub queue_capacity: usize,
    /// Staffer selection for unqualified calls.
    pub selection: SelectionPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            selection: SelectionPolicy::LowestAccount,
        }
    }
}

/// Password checks.
///
/// Each map goes from account to the lowercase hex SHA-256 digest of its
/// password. Accounts without an entry log in with any password.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Staffer credentials.
    pub staffers: BTreeMap<String, String>,
    /// User credentials.
    pub users: BTreeMap<String, String>,
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive, e.g. `info` or `hotline_server=debug`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
