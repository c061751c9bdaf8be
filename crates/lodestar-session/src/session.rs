//! Session types: the data structures that represent an authenticated player.
//!
//! A "session" is the server's record of a logged-in player. It tracks:
//! - WHO the player is (`PlayerId`, username)
//! - WHERE they are connected from (connection id, IP), if anywhere
//! - WHEN it expires (extended on every authorized packet)
//!
//! A session does not own its connection, and a connection does not own
//! its session. The session only remembers the *id* of the connection bound
//! to it; the connection only remembers the *token*. Either side can go away
//! without tearing down the other.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use lodestar_protocol::{PlayerId, PlayerInfo, SessionStatus, SessionToken};
use lodestar_transport::ConnectionId;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session lives without activity. Every authorized packet
    /// pushes expiry out by this much again.
    ///
    /// Default: 30 minutes.
    pub ttl: Duration,

    /// How often the server sweeps expired sessions out of the registry.
    ///
    /// Default: 30 seconds. Expiry is also checked lazily on lookup, so
    /// this only bounds how long dead entries occupy memory.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A single player's session on the server.
///
/// Lookups hand out clones; the authoritative copy lives in the
/// [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct Session {
    /// The secret the client presents to resume this session.
    pub token: SessionToken,

    /// Which player this session belongs to.
    pub player_id: PlayerId,

    /// The player's username as stored.
    pub username: String,

    /// The connection currently bound to this session, if any.
    ///
    /// At most one connection is bound at a time. Rebinding replaces the
    /// id; the previous connection isn't closed, it just stops matching.
    pub connection_id: Option<ConnectionId>,

    /// When the session was created.
    pub created_at: Instant,

    /// When the session expires unless extended.
    pub expires_at: Instant,

    /// Last time the session was used.
    pub last_activity: Instant,

    /// `Online` while a connection is bound.
    pub status: SessionStatus,

    /// Address the session was created from.
    pub ip_address: IpAddr,
}

impl Session {
    /// Returns `true` once `expires_at` has been reached.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Expiry check against a caller-supplied clock reading.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry (zero if already expired).
    pub fn expires_in(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` if `connection_id` is the connection bound right now.
    pub fn is_bound_to(&self, connection_id: ConnectionId) -> bool {
        self.connection_id == Some(connection_id)
    }

    /// The player-facing view of this session.
    pub fn player_info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.player_id,
            username: self.username.clone(),
        }
    }
}
