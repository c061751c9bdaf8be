//! Unified error type for the Lodestar server.

use std::time::Duration;

use lodestar_protocol::{CorrelationId, PacketType, ProtocolError};
use lodestar_session::SessionError;
use lodestar_transport::{ConnectionId, TransportError};

use crate::ServerStatus;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each wrapped variant generates a `From`
/// impl, so `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum LodestarError {
    /// A transport-level error (bind, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (unknown token, expired).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// `start` was called while the server wasn't stopped.
    #[error("server cannot start while {0}")]
    AlreadyRunning(ServerStatus),

    /// The connection has already been disconnected.
    #[error("{0} is already closed")]
    AlreadyClosed(ConnectionId),

    /// Two registrations were supplied for the same tag.
    #[error("duplicate handler registration for {0}")]
    DuplicateHandler(PacketType),

    /// A handler was invoked with a packet it wasn't registered for.
    #[error("handler received unexpected {0} packet")]
    UnexpectedPacket(PacketType),

    /// An auth-gated handler ran without an authorized session.
    #[error("no authorized session")]
    NotAuthenticated,
}

/// Why a correlated request didn't produce a reply.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No reply arrived before the deadline. The pending entry is gone, so
    /// a reply that shows up later is discarded.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The connection closed while the request was outstanding.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    /// A request with this correlation id is already outstanding.
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(CorrelationId),

    /// The request frame couldn't be written.
    #[error("request could not be sent: {0}")]
    Send(String),

    /// The reply arrived but wasn't the packet the caller expects.
    #[error("unexpected {0} reply")]
    UnexpectedReply(PacketType),
}
