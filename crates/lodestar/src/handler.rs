//! Per-connection handler: read loop, auth gate, and packet dispatch.
//!
//! Each accepted connection gets its own Tokio task running
//! [`handle_connection`]. The flow per frame is:
//!   1. Decode the envelope (bad frame → `ErrorResponse`, keep going)
//!   2. If it answers one of our pending requests → complete it, done
//!   3. Resolve the handler by tag (none → `UnknownPacket`)
//!   4. If the handler is gated, check the session (fail → `Unauthorized`)
//!   5. Run the handler, write its reply with the request's correlation id
//!
//! Handlers run inline on the read loop, so replies go out in request
//! order. A handler must not await a correlated request on its own peer:
//! the reply would be read by the loop that is waiting on the handler.

use std::sync::Arc;

use lodestar_protocol::{CorrelationId, Envelope, ErrorCode, ErrorResponse, ProtocolError};
use lodestar_session::Session;
use lodestar_transport::ConnectionId;

use crate::registry::HandlerContext;
use crate::{Peer, ServerState};

/// Drop guard that detaches a peer from the server when its task exits.
///
/// Removes the peer from the live-connection registry and unbinds its
/// session (which survives, `Offline`, for a later reconnect). Runs even
/// if the handler task panics.
struct PeerGuard {
    conn_id: ConnectionId,
    state: Arc<ServerState>,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.state.peers.remove(&self.conn_id);
        if let Some(token) = self.state.sessions().unbind_connection(self.conn_id) {
            tracing::debug!(conn_id = %self.conn_id, token = %token, "session unbound");
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection(peer: Arc<Peer>, state: Arc<ServerState>) {
    let conn_id = peer.id();
    let _guard = PeerGuard {
        conn_id,
        state: Arc::clone(&state),
    };
    let cancel = peer.cancellation().clone();
    let idle_timeout = state.config().idle_timeout;

    tracing::debug!(%conn_id, remote = %peer.remote_addr(), "handling new connection");

    let reason = loop {
        let read = tokio::select! {
            // Shutdown wins over frames still buffered from the client.
            biased;
            () = cancel.cancelled() => break "server shutting down",
            read = tokio::time::timeout(idle_timeout, peer.recv()) => read,
        };

        let data = match read {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::info!(%conn_id, "connection closed by client");
                break "connection closed";
            }
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "recv error");
                break "transport error";
            }
            Err(_) => {
                tracing::info!(%conn_id, ?idle_timeout, "connection idle, closing");
                break "idle timeout";
            }
        };

        dispatch_frame(&peer, &state, &data).await;
    };

    // Already closed when the disconnect came from elsewhere (stop, sweep).
    let _ = peer.disconnect(reason).await;
    // _guard drops here → registry entry removed, session unbound.
}

/// Decodes one frame and routes it.
async fn dispatch_frame(peer: &Arc<Peer>, state: &ServerState, data: &[u8]) {
    let envelope = match state.codec().decode(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(conn_id = %peer.id(), error = %e, len = data.len(), "dropping undecodable frame");
            let (code, message) = match &e {
                ProtocolError::UnknownType { tag, .. } => {
                    (ErrorCode::UnknownPacket, format!("unknown packet type {tag:?}"))
                }
                _ => (ErrorCode::MalformedPacket, "malformed packet".to_string()),
            };
            send_error(peer, e.correlation_id().cloned(), code, &message).await;
            return;
        }
    };

    if let Some(envelope) = peer.resolve_reply(envelope) {
        dispatch(peer, state, envelope).await;
    }
}

/// Runs the registered handler for a decoded request.
async fn dispatch(peer: &Arc<Peer>, state: &ServerState, envelope: Envelope) {
    let conn_id = peer.id();
    let packet_type = envelope.packet.packet_type();
    let correlation_id = envelope.correlation_id;

    let Some(registration) = state.handlers().resolve(packet_type) else {
        if correlation_id.is_some() {
            // A reply whose request already timed out.
            tracing::debug!(%conn_id, %packet_type, "discarding late reply");
        } else {
            tracing::debug!(%conn_id, %packet_type, "no handler registered");
            let message = format!("no handler for {packet_type}");
            send_error(peer, None, ErrorCode::UnknownPacket, &message).await;
        }
        return;
    };

    let session = if registration.requires_auth {
        match authorize(peer, state) {
            Some(session) => Some(session),
            None => {
                tracing::debug!(%conn_id, %packet_type, "rejected unauthenticated packet");
                send_error(
                    peer,
                    correlation_id,
                    ErrorCode::Unauthorized,
                    "authentication required",
                )
                .await;
                return;
            }
        }
    } else {
        None
    };

    let ctx = HandlerContext {
        peer,
        state,
        connection_id: conn_id,
        session: session.as_ref(),
    };

    match (registration.handler)(ctx, envelope.packet).await {
        Ok(Some(reply)) => {
            let reply = Envelope {
                correlation_id,
                packet: reply,
            };
            if let Err(e) = peer.send(&reply).await {
                tracing::debug!(%conn_id, %packet_type, error = %e, "reply dropped");
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!(%conn_id, %packet_type, error = %e, "handler failed");
            send_error(peer, correlation_id, ErrorCode::InternalError, "internal error").await;
        }
    }
}

/// The session this peer may act as, or `None`.
///
/// A token that no longer resolves (logged out, expired) or whose session
/// is now bound to a different connection (rebound elsewhere) is stale:
/// it's cleared from the peer and the packet is treated as unauthenticated.
/// On success the session's expiry is extended.
fn authorize(peer: &Peer, state: &ServerState) -> Option<Session> {
    let token = peer.session_token()?;
    match state.sessions().get_by_token(&token) {
        Some(session) if session.is_bound_to(peer.id()) => {
            if let Err(e) = state.sessions().extend_session(&token) {
                tracing::debug!(conn_id = %peer.id(), error = %e, "session extend failed");
            }
            Some(session)
        }
        _ => {
            peer.clear_session_if(&token);
            tracing::debug!(conn_id = %peer.id(), "stale session link cleared");
            None
        }
    }
}

/// Sends an `ErrorResponse` to the client, echoing the request's id.
async fn send_error(
    peer: &Peer,
    correlation_id: Option<CorrelationId>,
    code: ErrorCode,
    message: &str,
) {
    let envelope = Envelope {
        correlation_id,
        packet: ErrorResponse::new(code, message).into(),
    };
    if let Err(e) = peer.send(&envelope).await {
        tracing::debug!(conn_id = %peer.id(), error = %e, "error response dropped");
    }
}
