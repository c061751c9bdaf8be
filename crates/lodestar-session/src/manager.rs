//! The session manager: tracks all live player sessions.
//!
//! Responsibilities:
//! - Creating sessions when players log in
//! - Binding and unbinding connections (at most one per session)
//! - Extending sessions on activity
//! - Expiring sessions, lazily on lookup and eagerly in [`sweep_expired`]
//!
//! # Concurrency note
//!
//! Every connection task touches the manager, so both indexes are
//! [`DashMap`]s and every method takes `&self`. Each mutation of a single
//! session happens under that entry's shard lock, which makes operations
//! like [`bind_connection`] atomic per token.
//!
//! Lock order: a `sessions` guard may be taken while **no** `by_connection`
//! guard is held, never the other way round. Methods below clone what they
//! need out of one map and drop the guard before touching the other.
//!
//! [`sweep_expired`]: SessionManager::sweep_expired
//! [`bind_connection`]: SessionManager::bind_connection

use std::net::IpAddr;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lodestar_protocol::{PlayerId, SessionStatus, SessionToken};
use lodestar_transport::ConnectionId;

use crate::{Session, SessionConfig, SessionError};

/// Manages all live player sessions.
///
/// ## Lifecycle
///
/// ```text
/// login ──→ create_session() ──→ [Online] ──unbind_connection()──→ [Offline]
///                                   ▲                                  │
///                                   └────────── bind_connection() ─────┘
///
/// any state ──(ttl elapsed)──→ removed by get_by_token() / sweep_expired()
/// any state ──remove_session()──→ removed (logout)
/// ```
pub struct SessionManager {
    /// All sessions, keyed by their token.
    sessions: DashMap<SessionToken, Session>,

    /// Reverse index: which session a connection is bound to.
    ///
    /// May briefly hold entries that no longer match the session's
    /// `connection_id`; lookups through it always re-check the session.
    by_connection: DashMap<ConnectionId, SessionToken>,

    config: SessionConfig,
}

impl SessionManager {
    /// Creates a new, empty session manager with the given config.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            by_connection: DashMap::new(),
            config,
        }
    }

    /// The config this manager was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates a session for a freshly authenticated player.
    ///
    /// If `connection_id` is given, the session is bound to it and marked
    /// `Online`; any session that connection was bound to before loses its
    /// binding.
    ///
    /// # Errors
    /// Returns [`SessionError::TokenCollision`] if the generated token is
    /// already in use. The existing session is left untouched.
    pub fn create_session(
        &self,
        player_id: PlayerId,
        username: impl Into<String>,
        connection_id: Option<ConnectionId>,
        ip_address: IpAddr,
    ) -> Result<Session, SessionError> {
        let now = Instant::now();
        let token = SessionToken::generate();
        let session = Session {
            token: token.clone(),
            player_id,
            username: username.into(),
            connection_id,
            created_at: now,
            expires_at: now + self.config.ttl,
            last_activity: now,
            status: if connection_id.is_some() {
                SessionStatus::Online
            } else {
                SessionStatus::Offline
            },
            ip_address,
        };

        match self.sessions.entry(token.clone()) {
            Entry::Occupied(_) => {
                tracing::error!(%player_id, "refusing to overwrite session on token collision");
                return Err(SessionError::TokenCollision);
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }

        if let Some(connection_id) = connection_id {
            self.index_connection(connection_id, &token);
        }

        tracing::info!(%player_id, token = %token, "session created");
        Ok(session)
    }

    /// Looks up a live session by token.
    ///
    /// An expired session is removed on the spot and reported as absent.
    pub fn get_by_token(&self, token: &SessionToken) -> Option<Session> {
        let session = self.sessions.get(token)?.clone();
        if session.is_expired() {
            self.remove_if_expired(token, Instant::now());
            return None;
        }
        Some(session)
    }

    /// Looks up the live session currently bound to `connection_id`.
    pub fn get_by_connection(&self, connection_id: ConnectionId) -> Option<Session> {
        let token = self.by_connection.get(&connection_id)?.clone();
        self.get_by_token(&token)
            .filter(|session| session.is_bound_to(connection_id))
    }

    /// Binds `connection_id` to the session named by `token`.
    ///
    /// Replaces whatever connection was bound before and returns its id.
    /// The replaced connection is not closed; it simply stops matching the
    /// session, so its next authorized packet is rejected.
    ///
    /// # Errors
    /// - [`SessionError::InvalidToken`]: no such session
    /// - [`SessionError::SessionExpired`]: the session timed out (and is removed)
    pub fn bind_connection(
        &self,
        token: &SessionToken,
        connection_id: ConnectionId,
    ) -> Result<Option<ConnectionId>, SessionError> {
        let now = Instant::now();
        let previous = {
            let mut session = self
                .sessions
                .get_mut(token)
                .ok_or(SessionError::InvalidToken)?;
            if session.is_expired_at(now) {
                None
            } else {
                let previous = session.connection_id.replace(connection_id);
                session.status = SessionStatus::Online;
                session.last_activity = now;
                Some(previous)
            }
        };

        let Some(previous) = previous else {
            self.remove_if_expired(token, now);
            return Err(SessionError::SessionExpired);
        };

        if let Some(old) = previous.filter(|old| *old != connection_id) {
            self.by_connection.remove_if(&old, |_, bound| bound == token);
            tracing::info!(token = %token, from = %old, to = %connection_id, "session rebound");
        }
        self.index_connection(connection_id, token);

        Ok(previous)
    }

    /// Detaches `connection_id` from its session, if it has one.
    ///
    /// The session itself survives (marked `Offline`) so the player can
    /// reconnect with the token later. Returns the token it was bound to.
    pub fn unbind_connection(&self, connection_id: ConnectionId) -> Option<SessionToken> {
        let (_, token) = self.by_connection.remove(&connection_id)?;
        if let Some(mut session) = self.sessions.get_mut(&token) {
            if session.is_bound_to(connection_id) {
                session.connection_id = None;
                session.status = SessionStatus::Offline;
                session.last_activity = Instant::now();
            }
        }
        Some(token)
    }

    /// Pushes the session's expiry out by one TTL from now.
    ///
    /// # Errors
    /// - [`SessionError::InvalidToken`]: no such session
    /// - [`SessionError::SessionExpired`]: already too late (and removed)
    pub fn extend_session(&self, token: &SessionToken) -> Result<(), SessionError> {
        let now = Instant::now();
        let extended = {
            let mut session = self
                .sessions
                .get_mut(token)
                .ok_or(SessionError::InvalidToken)?;
            if session.is_expired_at(now) {
                false
            } else {
                session.expires_at = now + self.config.ttl;
                session.last_activity = now;
                true
            }
        };

        if extended {
            Ok(())
        } else {
            self.remove_if_expired(token, now);
            Err(SessionError::SessionExpired)
        }
    }

    /// Removes a session outright (logout). Idempotent.
    pub fn remove_session(&self, token: &SessionToken) -> Option<Session> {
        let (_, session) = self.sessions.remove(token)?;
        self.drop_index(&session);
        tracing::info!(player_id = %session.player_id, token = %token, "session removed");
        Some(session)
    }

    /// Removes every expired session and returns them.
    ///
    /// Callers use the returned `connection_id`s to tell still-connected
    /// clients that their session is gone.
    pub fn sweep_expired(&self) -> Vec<Session> {
        let now = Instant::now();

        // Collect first: removing while iterating would deadlock on the
        // shard the iterator is holding.
        let candidates: Vec<SessionToken> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let expired: Vec<Session> = candidates
            .iter()
            .filter_map(|token| self.remove_if_expired(token, now))
            .collect();

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions swept");
        }
        expired
    }

    /// Returns the number of sessions (expired ones not yet swept included).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every session and binding.
    pub fn clear(&self) {
        self.sessions.clear();
        self.by_connection.clear();
    }

    // -- internals --------------------------------------------------------

    /// Points `connection_id` at `token`, unbinding whatever session the
    /// connection pointed at before.
    fn index_connection(&self, connection_id: ConnectionId, token: &SessionToken) {
        let replaced = self.by_connection.insert(connection_id, token.clone());
        if let Some(old_token) = replaced.filter(|old| old != token) {
            if let Some(mut old) = self.sessions.get_mut(&old_token) {
                if old.is_bound_to(connection_id) {
                    old.connection_id = None;
                    old.status = SessionStatus::Offline;
                }
            }
        }
    }

    /// Removes the session only if it is still expired at `now`, so a
    /// concurrent extend isn't undone.
    fn remove_if_expired(&self, token: &SessionToken, now: Instant) -> Option<Session> {
        let (_, session) = self
            .sessions
            .remove_if(token, |_, session| session.is_expired_at(now))?;
        self.drop_index(&session);
        tracing::debug!(player_id = %session.player_id, "session expired");
        Some(session)
    }

    fn drop_index(&self, session: &Session) {
        if let Some(connection_id) = session.connection_id {
            self.by_connection
                .remove_if(&connection_id, |_, bound| *bound == session.token);
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
