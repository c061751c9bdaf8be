//! Error types for the session layer.

/// Errors that can occur during session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The token doesn't name a live session.
    /// Could be a stale token, a typo, or a malicious attempt.
    #[error("invalid session token")]
    InvalidToken,

    /// The session existed but its expiry time has passed.
    #[error("session expired")]
    SessionExpired,

    /// A freshly generated token matched an existing one.
    ///
    /// With 256-bit tokens this should never happen; if it does, the
    /// insert is refused rather than overwriting someone else's session.
    #[error("session token collision")]
    TokenCollision,
}

/// Errors reported by a [`PlayerStore`](crate::PlayerStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A player with this username already exists.
    #[error("username {0:?} already exists")]
    Duplicate(String),

    /// No player with this id exists.
    #[error("player {0} not found")]
    NotFound(lodestar_protocol::PlayerId),

    /// The backing store failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
