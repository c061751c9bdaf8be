//! Wire protocol for Lodestar.
//!
//! This crate defines the "language" that clients and the server speak:
//!
//! - **Packets** ([`Packet`], [`PacketType`], and one struct per tag):
//!   the typed messages, registered statically by tag.
//! - **Envelope** ([`Envelope`]): a packet plus an optional correlation id.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how envelopes become frame
//!   payload bytes and back.
//! - **Errors** ([`ProtocolError`]): what can go wrong while decoding.
//!
//! # Architecture
//!
//! ```text
//! Transport (frames) → Protocol (Envelope) → Dispatch (handlers, sessions)
//! ```

mod codec;
mod envelope;
mod error;
mod packet;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use packet::{
    Disconnect, ErrorResponse, LoginRequest, LoginResponse, LogoutRequest, Packet, PacketType,
    Ping, Pong, ReconnectRequest, ReconnectResponse, RegisterRequest, RegisterResponse,
    SessionExpired, SessionInfoRequest, SessionInfoResponse,
};
pub use types::{
    CorrelationId, ErrorCode, NetworkStats, PlayerId, PlayerInfo, SessionStatus, SessionToken,
};
