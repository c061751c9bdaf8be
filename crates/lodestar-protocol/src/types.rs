//! Identity and value types shared by every packet.
//!
//! These are the small building blocks that appear inside packet payloads:
//! player and session identity, correlation ids, wire error codes, and the
//! statistics snapshot a client can ask for.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A unique identifier for a player record.
///
/// Serialized as a plain number (`#[serde(transparent)]`), so `PlayerId(42)`
/// is `42` on the wire rather than `{"0": 42}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

/// The secret a client presents to prove it owns a session.
///
/// 32 random bytes rendered as 64 lowercase hex characters. `Debug` and
/// `Display` only ever print a short prefix so tokens don't end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generates a fresh token from the thread-local CSPRNG.
    pub fn generate() -> Self {
        Self(random_hex::<32>())
    }

    /// Returns the full token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "{prefix}…")
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({self})")
    }
}

/// Pairs a request with its reply on one connection.
///
/// Opaque to the receiver: whoever sends a request picks the id, and the
/// reply simply echoes it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a random 128-bit id.
    ///
    /// Random rather than sequential so a locally generated id can't
    /// collide with one the remote side picked for its own requests.
    pub fn random() -> Self {
        Self(random_hex::<16>())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn random_hex<const N: usize>() -> String {
    let bytes: [u8; N] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Wire error codes
// ---------------------------------------------------------------------------

/// Stable error codes sent to clients in responses.
///
/// Internal failures are collapsed into `ServerError` / `InternalError`;
/// the client never sees the underlying error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorCode {
    /// Unknown user, wrong password, or blank credentials.
    InvalidCredentials,
    /// Registration picked a username that already exists.
    UsernameTaken,
    /// Registration username violates the naming rules.
    InvalidUsername,
    /// Too many failed logins; try again later.
    TooManyAttempts,
    /// The player store failed.
    ServerError,
    /// Catch-all for anything unexpected.
    InternalError,
    /// The packet requires an authenticated session.
    Unauthorized,
    /// The packet tag is unknown or has no handler.
    UnknownPacket,
    /// The frame could not be decoded.
    MalformedPacket,
    /// The presented session token is unknown or expired.
    InvalidSession,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidCredentials => "InvalidCredentials",
            Self::UsernameTaken => "UsernameTaken",
            Self::InvalidUsername => "InvalidUsername",
            Self::TooManyAttempts => "TooManyAttempts",
            Self::ServerError => "ServerError",
            Self::InternalError => "InternalError",
            Self::Unauthorized => "Unauthorized",
            Self::UnknownPacket => "UnknownPacket",
            Self::MalformedPacket => "MalformedPacket",
            Self::InvalidSession => "InvalidSession",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Payload value types
// ---------------------------------------------------------------------------

/// Public information about a logged-in player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    /// The player's id.
    pub player_id: PlayerId,
    /// The player's display username.
    pub username: String,
}

/// Whether a session currently has a live connection bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SessionStatus {
    /// A connection is bound.
    Online,
    /// The session survives without a connection (awaiting reconnect or expiry).
    Offline,
}

/// Per-connection traffic and latency counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    /// Bytes written, including length prefixes.
    pub bytes_sent: u64,
    /// Bytes read, including length prefixes.
    pub bytes_received: u64,
    /// Frames written.
    pub packets_sent: u64,
    /// Frames read.
    pub packets_received: u64,
    /// Last measured round-trip time, if a ping has completed.
    pub rtt_millis: Option<u64>,
    /// Seconds since the connection was accepted.
    pub connected_secs: u64,
}
