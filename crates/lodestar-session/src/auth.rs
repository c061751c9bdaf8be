//! Authentication: register, log in, log out.
//!
//! [`AuthService`] glues three seams together:
//!
//! - a [`PlayerStore`] that knows the accounts
//! - a [`PasswordHasher`] that knows how passwords are stored
//! - the [`SessionManager`] that hands out tokens
//!
//! It never touches the network. The dispatch layer calls it from the
//! login/register/logout handlers and turns an [`AuthFailure`] into an
//! `ErrorCode` on the wire.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lodestar_protocol::{ErrorCode, PlayerInfo, SessionToken};
use lodestar_transport::ConnectionId;

use crate::{NewPlayer, PasswordHasher, PlayerStore, Session, SessionManager, StoreError};

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// Validation and throttling knobs.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub min_username_len: usize,
    pub max_username_len: usize,
    pub min_password_len: usize,

    /// Failed logins allowed per username before it's locked out.
    pub max_failed_attempts: u32,

    /// How long a lockout lasts, and the window failures are counted in.
    pub lockout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_username_len: 3,
            max_username_len: 16,
            min_password_len: 6,
            max_failed_attempts: 5,
            lockout: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why an auth operation failed.
///
/// The `Display` text is safe to send to clients: it never says whether
/// it was the username or the password that was wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("username is already taken")]
    UsernameTaken,

    #[error("username must be {min}-{max} letters, digits or underscores")]
    InvalidUsername { min: usize, max: usize },

    /// The player store failed. Details go to the log, not the client.
    #[error("server error, please try again later")]
    DatabaseError,

    #[error("too many failed login attempts, try again later")]
    TooManyAttempts,

    /// Credentials were fine but the session couldn't be created.
    #[error("internal error")]
    Internal,
}

impl AuthFailure {
    /// The wire code for this failure.
    pub fn error_code(self) -> ErrorCode {
        match self {
            Self::InvalidCredentials => ErrorCode::InvalidCredentials,
            Self::UsernameTaken => ErrorCode::UsernameTaken,
            Self::InvalidUsername { .. } => ErrorCode::InvalidUsername,
            Self::DatabaseError => ErrorCode::ServerError,
            Self::TooManyAttempts => ErrorCode::TooManyAttempts,
            Self::Internal => ErrorCode::InternalError,
        }
    }
}

/// Where a login attempt came from.
#[derive(Debug, Clone, Copy)]
pub struct LoginOrigin {
    /// The connection to bind the new session to, if any.
    pub connection_id: Option<ConnectionId>,
    pub ip_address: IpAddr,
}

/// A successful login.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub player: PlayerInfo,
    pub token: SessionToken,
    pub session: Session,
}

#[derive(Debug, Clone, Copy)]
struct FailedLogins {
    count: u32,
    window_start: Instant,
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Credential checks plus session issuance.
pub struct AuthService {
    store: Arc<dyn PlayerStore>,
    hasher: Arc<dyn PasswordHasher>,
    sessions: Arc<SessionManager>,
    config: AuthConfig,
    /// Failed logins per lowercased username.
    failures: DashMap<String, FailedLogins>,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn PlayerStore>,
        hasher: Arc<dyn PasswordHasher>,
        sessions: Arc<SessionManager>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            hasher,
            sessions,
            config,
            failures: DashMap::new(),
        }
    }

    /// The session manager new sessions are created in.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Checks credentials and creates a session.
    ///
    /// Blank credentials are rejected before the store is consulted. An
    /// unknown user and a wrong password look identical to the caller.
    ///
    /// # Errors
    /// `InvalidCredentials`, `TooManyAttempts`, `DatabaseError`, `Internal`.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        origin: LoginOrigin,
    ) -> Result<LoginGrant, AuthFailure> {
        let username = username.trim();
        if username.is_empty() || password.trim().is_empty() {
            return Err(AuthFailure::InvalidCredentials);
        }

        let key = username.to_lowercase();
        if self.is_locked_out(&key) {
            tracing::warn!(username, ip = %origin.ip_address, "login refused: locked out");
            return Err(AuthFailure::TooManyAttempts);
        }

        let record = match self.store.find_by_username(username).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.record_failure(&key);
                tracing::info!(username, ip = %origin.ip_address, "login failed: unknown user");
                return Err(AuthFailure::InvalidCredentials);
            }
            Err(e) => {
                tracing::error!(error = %e, "player lookup failed");
                return Err(AuthFailure::DatabaseError);
            }
        };

        if !self.hasher.verify(password, &record.password_hash) {
            self.record_failure(&key);
            tracing::info!(player_id = %record.id, ip = %origin.ip_address, "login failed: bad password");
            return Err(AuthFailure::InvalidCredentials);
        }
        self.failures.remove(&key);

        let session = self
            .sessions
            .create_session(
                record.id,
                record.username.clone(),
                origin.connection_id,
                origin.ip_address,
            )
            .map_err(|e| {
                tracing::error!(error = %e, player_id = %record.id, "session creation failed");
                AuthFailure::Internal
            })?;

        if let Err(e) = self.store.update_last_seen(record.id).await {
            tracing::warn!(error = %e, player_id = %record.id, "failed to update last seen");
        }

        tracing::info!(player_id = %record.id, ip = %origin.ip_address, "player logged in");
        Ok(LoginGrant {
            player: record.info(),
            token: session.token.clone(),
            session,
        })
    }

    /// Creates an account. Does not log in.
    ///
    /// # Errors
    /// `InvalidUsername`, `InvalidCredentials` (password too short),
    /// `UsernameTaken`, `DatabaseError`.
    pub async fn register(&self, username: &str, password: &str) -> Result<PlayerInfo, AuthFailure> {
        let username = username.trim();
        if !self.is_valid_username(username) {
            return Err(AuthFailure::InvalidUsername {
                min: self.config.min_username_len,
                max: self.config.max_username_len,
            });
        }
        if password.trim().is_empty() || password.chars().count() < self.config.min_password_len {
            return Err(AuthFailure::InvalidCredentials);
        }

        match self.store.find_by_username(username).await {
            Ok(Some(_)) => return Err(AuthFailure::UsernameTaken),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "player lookup failed");
                return Err(AuthFailure::DatabaseError);
            }
        }

        let new_player = NewPlayer {
            username: username.to_string(),
            password_hash: self.hasher.hash(password),
        };
        match self.store.create(new_player).await {
            Ok(record) => {
                tracing::info!(player_id = %record.id, username, "player registered");
                Ok(record.info())
            }
            // Lost a race with a concurrent register of the same name.
            Err(StoreError::Duplicate(_)) => Err(AuthFailure::UsernameTaken),
            Err(e) => {
                tracing::error!(error = %e, "player create failed");
                Err(AuthFailure::DatabaseError)
            }
        }
    }

    /// Ends a session. Returns `false` if it was already gone.
    pub fn logout(&self, token: &SessionToken) -> bool {
        match self.sessions.remove_session(token) {
            Some(session) => {
                tracing::info!(player_id = %session.player_id, "player logged out");
                true
            }
            None => false,
        }
    }

    /// Drops failure counters whose window has lapsed. Returns how many
    /// were removed.
    ///
    /// Counters are keyed by the attempted username, so failed logins for
    /// names that never come back would otherwise accumulate.
    pub fn sweep_failures(&self) -> usize {
        let lockout = self.config.lockout;
        let before = self.failures.len();
        self.failures.retain(|_, f| f.window_start.elapsed() < lockout);
        before.saturating_sub(self.failures.len())
    }

    /// Usernames with a live failure counter.
    pub fn tracked_failures(&self) -> usize {
        self.failures.len()
    }

    /// Trimmed length within bounds, ASCII letters, digits and `_` only.
    pub fn is_valid_username(&self, username: &str) -> bool {
        let len = username.chars().count();
        (self.config.min_username_len..=self.config.max_username_len).contains(&len)
            && username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn is_locked_out(&self, key: &str) -> bool {
        let Some(entry) = self.failures.get(key).map(|entry| *entry) else {
            return false;
        };
        if entry.window_start.elapsed() >= self.config.lockout {
            self.failures.remove(key);
            return false;
        }
        entry.count >= self.config.max_failed_attempts
    }

    fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let lockout = self.config.lockout;
        self.failures
            .entry(key.to_string())
            .and_modify(|f| {
                if f.window_start.elapsed() >= lockout {
                    *f = FailedLogins {
                        count: 1,
                        window_start: now,
                    };
                } else {
                    f.count += 1;
                }
            })
            .or_insert(FailedLogins {
                count: 1,
                window_start: now,
            });
    }
}
