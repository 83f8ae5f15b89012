//! JSON wire contract spoken with staffer and user clients.
//!
//! Every frame is a JSON object carrying a `cmd` tag plus command-specific
//! fields. Inbound frames are decoded in two steps: [`decode_command`] reads
//! only the tag, then the dispatcher decodes the full body it needs. Chat and
//! signaling frames are relayed to the peer verbatim, so their bodies are
//! never re-encoded.
//!
//! | Tag | Direction | Body |
//! |-----|-----------|------|
//! | `CMD_STAFFER_LOGIN` | in | [`LoginRequest`] |
//! | `CMD_USER_LOGIN` | in | [`LoginRequest`] |
//! | `CMD_CALL` | in | [`CallRequest`] |
//! | `CMD_CHAT` | in/out | [`ChatRequest`], relayed verbatim |
//! | `CMD_WEBRTC` | in/out | opaque, relayed verbatim |
//! | `CMD_HANGUP` | in | none |
//! | `CMD_*_ACK` | out | [`Ack`] |
//! | `CMD_SESSION_BEGIN` | out | [`SessionBegin`] |
//! | `CMD_SESSION_END` | out | [`Ack`] |

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::ProtocolError;

/// Command tag carried in the `cmd` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Staffer login request.
    #[serde(rename = "CMD_STAFFER_LOGIN")]
    StafferLogin,
    /// Reply to a staffer login.
    #[serde(rename = "CMD_STAFFER_LOGIN_ACK")]
    StafferLoginAck,
    /// User login request.
    #[serde(rename = "CMD_USER_LOGIN")]
    UserLogin,
    /// Reply to a user login.
    #[serde(rename = "CMD_USER_LOGIN_ACK")]
    UserLoginAck,
    /// Call request from a user.
    #[serde(rename = "CMD_CALL")]
    Call,
    /// Reply to a failed call request.
    #[serde(rename = "CMD_CALL_ACK")]
    CallAck,
    /// Sent to both parties when a call is matched.
    #[serde(rename = "CMD_SESSION_BEGIN")]
    SessionBegin,
    /// Sent when a session is torn down.
    #[serde(rename = "CMD_SESSION_END")]
    SessionEnd,
    /// Chat text, relayed to the peer.
    #[serde(rename = "CMD_CHAT")]
    Chat,
    /// WebRTC signaling, relayed to the peer.
    #[serde(rename = "CMD_WEBRTC")]
    Webrtc,
    /// End the current session.
    #[serde(rename = "CMD_HANGUP")]
    Hangup,
}

impl Command {
    /// The wire tag for this command.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StafferLogin => "CMD_STAFFER_LOGIN",
            Self::StafferLoginAck => "CMD_STAFFER_LOGIN_ACK",
            Self::UserLogin => "CMD_USER_LOGIN",
            Self::UserLoginAck => "CMD_USER_LOGIN_ACK",
            Self::Call => "CMD_CALL",
            Self::CallAck => "CMD_CALL_ACK",
            Self::SessionBegin => "CMD_SESSION_BEGIN",
            Self::SessionEnd => "CMD_SESSION_END",
            Self::Chat => "CMD_CHAT",
            Self::Webrtc => "CMD_WEBRTC",
            Self::Hangup => "CMD_HANGUP",
        }
    }

    /// Resolve a tag that clients are allowed to send.
    ///
    /// Server-to-client tags (acks, session notifications) are not accepted
    /// inbound and resolve to `None`.
    pub fn inbound(tag: &str) -> Option<Self> {
        match tag {
            "CMD_STAFFER_LOGIN" => Some(Self::StafferLogin),
            "CMD_USER_LOGIN" => Some(Self::UserLogin),
            "CMD_CALL" => Some(Self::Call),
            "CMD_CHAT" => Some(Self::Chat),
            "CMD_WEBRTC" => Some(Self::Webrtc),
            "CMD_HANGUP" => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result code carried in the `error` field of acks and session-end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ErrorCode {
    /// Request accepted.
    Success = 0,
    /// Caller is not a logged-in user on this connection.
    UserNotLogin = 1,
    /// Requested staffer is not logged in.
    StafferNotLogin = 2,
    /// Account is already logged in.
    AlreadyLogin = 3,
    /// Username was empty.
    Username = 4,
    /// Password did not match.
    Password = 5,
    /// No eligible staffer was idle.
    AllBusy = 6,
    /// The other party of the session disconnected.
    PeerOffline = 7,
}

impl ErrorCode {
    /// Short label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UserNotLogin => "user_not_login",
            Self::StafferNotLogin => "staffer_not_login",
            Self::AlreadyLogin => "already_login",
            Self::Username => "bad_username",
            Self::Password => "bad_password",
            Self::AllBusy => "all_busy",
            Self::PeerOffline => "peer_offline",
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Success,
            1 => Self::UserNotLogin,
            2 => Self::StafferNotLogin,
            3 => Self::AlreadyLogin,
            4 => Self::Username,
            5 => Self::Password,
            6 => Self::AllBusy,
            7 => Self::PeerOffline,
            other => return Err(ProtocolError::InvalidErrorCode(other)),
        })
    }
}

#[derive(Deserialize)]
struct Header {
    cmd: String,
}

/// Read the `cmd` tag of an inbound frame.
///
/// Fails with [`ProtocolError::Malformed`] when the frame is not a JSON
/// object with a string `cmd`, and with [`ProtocolError::UnknownCommand`]
/// when the tag is not accepted from clients.
pub fn decode_command(payload: &str) -> Result<Command, ProtocolError> {
    let header: Header = serde_json::from_str(payload)?;
    Command::inbound(&header.cmd).ok_or(ProtocolError::UnknownCommand(header.cmd))
}

/// Decode the full body of an inbound frame.
pub fn decode<'a, T: Deserialize<'a>>(payload: &'a str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(payload)?)
}

/// Serialize an outbound frame.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Body of `CMD_STAFFER_LOGIN` and `CMD_USER_LOGIN`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    /// Account identifier, unique within its role.
    pub username: String,
    /// Password; only checked when the server has a credential for the account.
    pub password: String,
    /// Affinity tag.
    pub agent: String,
}

/// Body of `CMD_CALL`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallRequest {
    /// Account of the calling user.
    pub caller: String,
    /// Specific staffer to call. Absent or empty means "any idle staffer".
    #[serde(deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub callee: Option<String>,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Body of `CMD_CHAT`. Only used to validate before relaying.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatRequest {
    /// Chat text.
    pub text: String,
}

/// Reply carrying only a result code (`CMD_*_ACK`, `CMD_SESSION_END`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Reply tag.
    pub cmd: Command,
    /// Result code.
    pub error: ErrorCode,
}

impl Ack {
    /// Build an ack for the given tag.
    pub fn new(cmd: Command, error: ErrorCode) -> Self {
        Self { cmd, error }
    }

    /// `CMD_SESSION_END` with the given reason.
    pub fn session_end(error: ErrorCode) -> Self {
        Self::new(Command::SessionEnd, error)
    }
}

/// A TURN/STUN relay descriptor handed to both parties at session begin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URL, e.g. `turn:host:3478`.
    pub urls: String,
    /// Relay username.
    #[serde(default)]
    pub username: String,
    /// Relay credential.
    #[serde(default)]
    pub credential: String,
}

/// `CMD_SESSION_BEGIN`, sent to both parties of a new session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBegin {
    /// Always [`Command::SessionBegin`].
    pub cmd: Command,
    /// Staffer account.
    pub staffer: String,
    /// User account.
    pub user: String,
    /// Relay servers for the media path.
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

impl SessionBegin {
    /// Build a session-begin notification.
    pub fn new(staffer: &str, user: &str, ice_servers: Vec<IceServer>) -> Self {
        Self {
            cmd: Command::SessionBegin,
            staffer: staffer.to_owned(),
            user: user.to_owned(),
            ice_servers,
        }
    }
}
