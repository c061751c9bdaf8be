//! # Lodestar
//!
//! Session-aware TCP packet server for multiplayer games.
//!
//! Lodestar accepts TCP clients, frames and decodes typed packets, runs
//! the handler registered for each packet's tag (gating some behind an
//! authenticated session), and correlates server-initiated requests with
//! their replies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lodestar::prelude::*;
//!
//! # async fn run() -> Result<(), LodestarError> {
//! let server = Server::builder()
//!     .bind(([127, 0, 0, 1], 7777))
//!     .build()?;
//! server.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! ```text
//! lodestar-transport  TCP listener, length-prefixed frames
//! lodestar-protocol   Envelope, packets, codec
//! lodestar-session    sessions, authentication, player store seams
//! lodestar (this)     peers, handler registry, dispatch, server lifecycle
//! ```

mod error;
mod handler;
pub mod handlers;
mod peer;
mod registry;
mod server;
mod stats;

pub use error::{LodestarError, RequestError};
pub use peer::Peer;
pub use registry::{
    HandlerContext, HandlerEntry, HandlerFn, HandlerRegistry, HandlerResult, Registration,
};
pub use server::{DEFAULT_PORT, Server, ServerBuilder, ServerConfig, ServerState, ServerStatus};
pub use stats::ConnectionStats;

/// Everything needed to configure and run a server.
pub mod prelude {
    pub use crate::{
        ConnectionStats, HandlerContext, HandlerEntry, HandlerFn, HandlerResult, LodestarError,
        Peer, RequestError, Server, ServerBuilder, ServerConfig, ServerStatus,
    };
    pub use lodestar_protocol::{
        CorrelationId, Envelope, ErrorCode, Packet, PacketType, PlayerId, PlayerInfo,
        SessionToken,
    };
    pub use lodestar_session::{
        AuthConfig, MemoryPlayerStore, PasswordHasher, PlayerStore, SessionConfig,
        Sha256PasswordHasher,
    };
    pub use lodestar_transport::{ConnectionId, FrameConfig};
}
