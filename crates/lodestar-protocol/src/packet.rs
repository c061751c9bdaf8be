//! Packet schemas and the tag registry.
//!
//! Each packet is a plain struct. The [`packets!`] macro below turns the
//! list of structs into:
//!
//! - [`Packet`], an internally tagged enum (`{"type": "<Tag>", ...fields}`)
//!   with exactly one variant per tag, and
//! - [`PacketType`], a `Copy` key used by the handler registry.
//!
//! Because the mapping is generated at compile time from a single list,
//! every valid tag is enumerable ([`PacketType::ALL`]) and decoding a tag
//! never requires probing other schemas.

use serde::{Deserialize, Serialize};

use crate::{ErrorCode, NetworkStats, PlayerInfo, SessionStatus, SessionToken};

macro_rules! packets {
    ($( $(#[$meta:meta])* $name:ident ),+ $(,)?) => {
        /// A decoded packet: one variant per registered tag.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(tag = "type")]
        pub enum Packet {
            $( $(#[$meta])* $name($name), )+
        }

        /// The tag of a [`Packet`], without its payload.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum PacketType {
            $( $(#[$meta])* $name, )+
        }

        impl PacketType {
            /// Every registered tag, in declaration order.
            pub const ALL: &'static [PacketType] = &[ $( PacketType::$name, )+ ];

            /// The tag string used on the wire.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( PacketType::$name => stringify!($name), )+
                }
            }

            /// Looks up a tag string. `None` for unregistered tags.
            pub fn from_tag(tag: &str) -> Option<Self> {
                match tag {
                    $( stringify!($name) => Some(PacketType::$name), )+
                    _ => None,
                }
            }
        }

        impl Packet {
            /// Returns this packet's tag.
            pub fn packet_type(&self) -> PacketType {
                match self {
                    $( Packet::$name(_) => PacketType::$name, )+
                }
            }
        }

        $(
            impl From<$name> for Packet {
                fn from(packet: $name) -> Self {
                    Packet::$name(packet)
                }
            }
        )+
    };
}

packets! {
    /// Client → Server: log in with username and password.
    LoginRequest,
    /// Server → Client: login outcome.
    LoginResponse,
    /// Client → Server: create a player account.
    RegisterRequest,
    /// Server → Client: registration outcome.
    RegisterResponse,
    /// Client → Server: end the session. No reply.
    LogoutRequest,
    /// Client → Server: bind this connection to an existing session.
    ReconnectRequest,
    /// Server → Client: reconnect outcome.
    ReconnectResponse,
    /// Client → Server: describe my session.
    SessionInfoRequest,
    /// Server → Client: session description.
    SessionInfoResponse,
    /// Either direction: latency check.
    Ping,
    /// Either direction: latency check reply.
    Pong,
    /// Server → Client: a request failed at the protocol level.
    ErrorResponse,
    /// Server → Client: the bound session expired.
    SessionExpired,
    /// Server → Client: the server is closing this connection.
    Disconnect,
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Client asks to log in with a username and password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login outcome: a session token and player on success, an error code otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<SessionToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Client asks to create an account, optionally logging in right after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    /// Log in immediately after a successful registration.
    #[serde(default)]
    pub auto_login: bool,
}

/// Registration outcome.
///
/// `success && !logged_in` with `auto_login` requested means the account
/// exists but the follow-up login failed; the client should log in manually.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub logged_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<SessionToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ends the caller's session. The server sends no reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutRequest {}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Binds this connection to an existing session by its token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectRequest {
    pub session_token: SessionToken,
}

/// Reconnect outcome. Fails with `InvalidSession` for an unknown or expired token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Asks for the caller's session details and connection stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfoRequest {}

/// The caller's player, session status, time to expiry and traffic counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    pub player: PlayerInfo,
    pub status: SessionStatus,
    pub expires_in_secs: u64,
    pub stats: NetworkStats,
}

/// Server notice that this connection's session expired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExpired {}

// ---------------------------------------------------------------------------
// Connection control
// ---------------------------------------------------------------------------

/// Latency check. Either side may send it; the other answers with [`Pong`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    /// Sender's clock in milliseconds; echoed back in [`Pong`].
    pub client_time: u64,
}

/// Reply to [`Ping`], echoing its `client_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub client_time: u64,
    pub server_time: u64,
}

/// A request the server could not serve, with a wire error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    /// Builds an error response with a static message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Last frame before the server closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnect {
    pub reason: String,
}
