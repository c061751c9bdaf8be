//! Built-in packet handlers: login, register, logout, reconnect, session
//! info and ping.
//!
//! Each handler is a thin adapter: it unpacks its request, calls into the
//! [`AuthService`](lodestar_session::AuthService) or
//! [`SessionManager`](lodestar_session::SessionManager), and maps the
//! outcome onto a response packet. Domain failures become `success: false`
//! responses with an error code, not handler errors.

use futures_util::future::BoxFuture;
use lodestar_protocol::{
    ErrorCode, LoginResponse, Packet, PacketType, Pong, ReconnectResponse, RegisterResponse,
    SessionInfoResponse,
};
use lodestar_session::{LoginOrigin, SessionError};

use crate::registry::{HandlerContext, HandlerEntry, HandlerResult};
use crate::stats::unix_millis;
use crate::LodestarError;

/// Unwraps the expected request struct or fails the handler.
macro_rules! expect_packet {
    ($packet:expr, $variant:ident) => {
        match $packet {
            Packet::$variant(inner) => inner,
            other => return Err(LodestarError::UnexpectedPacket(other.packet_type())),
        }
    };
}

/// The registration table the server starts with.
pub fn builtin() -> Vec<HandlerEntry> {
    vec![
        HandlerEntry::public(PacketType::LoginRequest, login),
        HandlerEntry::public(PacketType::RegisterRequest, register),
        HandlerEntry::public(PacketType::ReconnectRequest, reconnect),
        HandlerEntry::public(PacketType::Ping, ping),
        HandlerEntry::authenticated(PacketType::LogoutRequest, logout),
        HandlerEntry::authenticated(PacketType::SessionInfoRequest, session_info),
    ]
}

fn origin(ctx: &HandlerContext<'_>) -> LoginOrigin {
    LoginOrigin {
        connection_id: Some(ctx.connection_id),
        ip_address: ctx.peer.remote_addr().ip(),
    }
}

fn login(ctx: HandlerContext<'_>, packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let request = expect_packet!(packet, LoginRequest);
        let auth = ctx.state.auth();

        let response = match auth
            .login(&request.username, &request.password, origin(&ctx))
            .await
        {
            Ok(grant) => {
                ctx.peer.set_session(grant.token.clone());
                LoginResponse {
                    success: true,
                    session_token: Some(grant.token),
                    player: Some(grant.player),
                    ..Default::default()
                }
            }
            Err(failure) => LoginResponse {
                success: false,
                error_code: Some(failure.error_code()),
                message: Some(failure.to_string()),
                ..Default::default()
            },
        };
        Ok(Some(response.into()))
    })
}

/// Registers, then logs in when `autoLogin` is set.
///
/// If registration succeeds but the follow-up login fails, the response
/// says `success: true, loggedIn: false` and carries the login's error
/// code, so the client can tell it apart from both outcomes.
fn register(ctx: HandlerContext<'_>, packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let request = expect_packet!(packet, RegisterRequest);
        let auth = ctx.state.auth();

        let player = match auth.register(&request.username, &request.password).await {
            Ok(player) => player,
            Err(failure) => {
                return Ok(Some(
                    RegisterResponse {
                        success: false,
                        error_code: Some(failure.error_code()),
                        message: Some(failure.to_string()),
                        ..Default::default()
                    }
                    .into(),
                ));
            }
        };

        if !request.auto_login {
            return Ok(Some(
                RegisterResponse {
                    success: true,
                    player: Some(player),
                    message: Some("registration complete".into()),
                    ..Default::default()
                }
                .into(),
            ));
        }

        let response = match auth
            .login(&request.username, &request.password, origin(&ctx))
            .await
        {
            Ok(grant) => {
                ctx.peer.set_session(grant.token.clone());
                RegisterResponse {
                    success: true,
                    logged_in: true,
                    session_token: Some(grant.token),
                    player: Some(grant.player),
                    ..Default::default()
                }
            }
            Err(failure) => {
                tracing::warn!(player_id = %player.player_id, error = %failure, "auto-login after registration failed");
                RegisterResponse {
                    success: true,
                    logged_in: false,
                    player: Some(player),
                    error_code: Some(failure.error_code()),
                    message: Some(format!("registered, but login failed: {failure}")),
                    ..Default::default()
                }
            }
        };
        Ok(Some(response.into()))
    })
}

/// Fire-and-forget: no reply.
fn logout(ctx: HandlerContext<'_>, packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        expect_packet!(packet, LogoutRequest);
        if let Some(token) = ctx.peer.clear_session() {
            ctx.state.auth().logout(&token);
        }
        Ok(None)
    })
}

/// Binds this connection to an existing session.
///
/// The connection previously bound to it is not closed. It finds out on
/// its next gated packet, which is rejected as `Unauthorized`.
fn reconnect(ctx: HandlerContext<'_>, packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let request = expect_packet!(packet, ReconnectRequest);
        let sessions = ctx.state.sessions();
        let token = request.session_token;

        let invalid = |failure: &dyn std::fmt::Display| ReconnectResponse {
            success: false,
            error_code: Some(ErrorCode::InvalidSession),
            message: Some(failure.to_string()),
            ..Default::default()
        };

        let response = match sessions.bind_connection(&token, ctx.connection_id) {
            Ok(previous) => {
                let _ = sessions.extend_session(&token);
                match sessions.get_by_token(&token) {
                    Some(session) => {
                        ctx.peer.set_session(token);
                        tracing::info!(
                            player_id = %session.player_id,
                            conn_id = %ctx.connection_id,
                            previous = ?previous,
                            "session resumed"
                        );
                        ReconnectResponse {
                            success: true,
                            player: Some(session.player_info()),
                            ..Default::default()
                        }
                    }
                    None => invalid(&SessionError::SessionExpired),
                }
            }
            Err(e @ (SessionError::InvalidToken | SessionError::SessionExpired)) => invalid(&e),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(response.into()))
    })
}

fn session_info(ctx: HandlerContext<'_>, packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        expect_packet!(packet, SessionInfoRequest);
        let session = ctx.session.ok_or(LodestarError::NotAuthenticated)?;
        // Re-read so the expiry reflects the extension for this packet.
        let session = ctx
            .state
            .sessions()
            .get_by_token(&session.token)
            .unwrap_or_else(|| session.clone());

        Ok(Some(
            SessionInfoResponse {
                player: session.player_info(),
                status: session.status,
                expires_in_secs: session.expires_in().as_secs(),
                stats: ctx.peer.stats().snapshot(),
            }
            .into(),
        ))
    })
}

fn ping(_ctx: HandlerContext<'_>, packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let request = expect_packet!(packet, Ping);
        Ok(Some(
            Pong {
                client_time: request.client_time,
                server_time: unix_millis(),
            }
            .into(),
        ))
    })
}
