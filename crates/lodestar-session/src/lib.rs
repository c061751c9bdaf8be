//! Player sessions and authentication for Lodestar.
//!
//! This crate knows who is logged in and how they got there:
//!
//! 1. **Accounts**: the [`PlayerStore`] and [`PasswordHasher`] seams, with
//!    in-memory / SHA-256 implementations for development and tests
//! 2. **Authentication**: [`AuthService`] registers players, checks
//!    credentials and throttles repeated failures
//! 3. **Session tracking**: [`SessionManager`] maps tokens to sessions and
//!    connections to tokens, with TTL-based expiry
//!
//! # How it fits in the stack
//!
//! ```text
//! Dispatch (above)  ← gates packets on sessions, calls AuthService from handlers
//!     ↕
//! Session Layer (this crate)  ← player identity, tokens, connection bindings
//!     ↕
//! Protocol / Transport (below)  ← PlayerId, SessionToken, ConnectionId
//! ```
//!
//! Nothing here does I/O on a connection; it only records connection ids.

mod auth;
mod error;
mod hasher;
mod manager;
mod session;
mod store;

pub use auth::{AuthConfig, AuthFailure, AuthService, LoginGrant, LoginOrigin};
pub use error::{SessionError, StoreError};
pub use hasher::{PasswordHasher, Sha256PasswordHasher};
pub use manager::SessionManager;
pub use session::{Session, SessionConfig};
pub use store::{MemoryPlayerStore, NewPlayer, PlayerRecord, PlayerStore};
