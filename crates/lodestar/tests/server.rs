//! Integration tests for the Lodestar server, dispatch, and full connection flow.
//!
//! Each test starts a real server on `127.0.0.1:0` and talks to it over TCP
//! with the same framing and JSON envelope a game client uses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use lodestar::prelude::*;
use lodestar_protocol::{
    Disconnect, ErrorResponse, LoginRequest, LoginResponse, LogoutRequest, Ping, Pong,
    ReconnectRequest, ReconnectResponse, RegisterRequest, RegisterResponse, SessionExpired,
    SessionInfoRequest, SessionInfoResponse, SessionStatus,
};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

// =========================================================================
// Helpers
// =========================================================================

struct Client {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("should connect");
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed
            .send(bytes::Bytes::from(bytes.to_vec()))
            .await
            .expect("send frame");
    }

    async fn send(&mut self, envelope: &Envelope) {
        let bytes = serde_json::to_vec(envelope).expect("encode");
        self.send_raw(&bytes).await;
    }

    /// Next envelope, or `None` once the server closed the stream.
    async fn try_recv(&mut self) -> Option<Envelope> {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")?
            .ok()?;
        Some(serde_json::from_slice(&frame).expect("decode"))
    }

    async fn recv(&mut self) -> Envelope {
        self.try_recv().await.expect("server closed the connection")
    }

    /// Sends a correlated request and returns the reply packet.
    async fn request(&mut self, packet: impl Into<Packet>) -> Packet {
        let id = CorrelationId::random();
        self.send(&Envelope::correlated(packet, id.clone())).await;
        let reply = self.recv().await;
        assert_eq!(reply.correlation_id, Some(id), "reply must echo the id");
        reply.packet
    }

    async fn login(&mut self, username: &str, password: &str) -> LoginResponse {
        let request = LoginRequest {
            username: username.into(),
            password: password.into(),
        };
        match self.request(request).await {
            Packet::LoginResponse(response) => response,
            other => panic!("expected LoginResponse, got {other:?}"),
        }
    }

    /// Asserts the server stays silent for a short while.
    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(150), self.framed.next()).await;
        assert!(next.is_err(), "expected no frame, got {next:?}");
    }
}

fn expect_error(packet: Packet) -> ErrorResponse {
    match packet {
        Packet::ErrorResponse(error) => error,
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
}

async fn start(builder: ServerBuilder) -> (Server, SocketAddr) {
    let server = builder
        .bind(([127, 0, 0, 1], 0))
        .build()
        .expect("server should build");
    let addr = server.start().await.expect("server should start");
    (server, addr)
}

/// Polls until the server has registered exactly one connection.
async fn single_peer(server: &Server) -> Arc<Peer> {
    for _ in 0..100 {
        if let Some(peer) = server.peers().pop() {
            return peer;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no connection registered");
}

/// Replies to `Ping` with a frame close to the 1 MiB limit.
fn oversized_reply(_ctx: HandlerContext<'_>, _packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async {
        let message = "x".repeat(900 * 1024);
        Ok(Some(ErrorResponse::new(ErrorCode::InternalError, message).into()))
    })
}

fn failing_handler(_ctx: HandlerContext<'_>, _packet: Packet) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async { Err(LodestarError::NotAuthenticated) })
}

/// A server with `alice` / `correct` already registered.
async fn start_with_alice() -> (Server, SocketAddr) {
    let (server, addr) = start(Server::builder()).await;
    server
        .auth()
        .register("alice", "correct")
        .await
        .expect("register alice");
    (server, addr)
}

// =========================================================================
// Login / logout
// =========================================================================

#[tokio::test]
async fn test_login_valid_credentials_returns_token() {
    let (server, addr) = start_with_alice().await;
    let mut client = Client::connect(addr).await;

    let response = client.login("alice", "correct").await;

    assert!(response.success);
    let token = response.session_token.expect("token");
    assert!(token.as_str().len() >= 32);
    assert_eq!(response.player.map(|p| p.username), Some("alice".into()));
    assert!(server.sessions().get_by_token(&token).is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_logout_invalidates_token_without_reply() {
    let (server, addr) = start_with_alice().await;
    let mut client = Client::connect(addr).await;
    let token = client.login("alice", "correct").await.session_token.unwrap();

    client
        .send(&Envelope::correlated(LogoutRequest {}, CorrelationId::random()))
        .await;
    client.expect_silence().await;

    assert!(server.sessions().get_by_token(&token).is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_login_empty_username_rejected_without_session() {
    let (server, addr) = start_with_alice().await;
    let mut client = Client::connect(addr).await;

    let response = client.login("", "x").await;

    assert!(!response.success);
    assert_eq!(response.error_code, Some(ErrorCode::InvalidCredentials));
    assert!(response.session_token.is_none());
    assert!(server.sessions().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_login_wrong_password_does_not_leak_which_check_failed() {
    let (server, addr) = start_with_alice().await;
    let mut client = Client::connect(addr).await;

    let wrong_password = client.login("alice", "incorrect").await;
    let unknown_user = client.login("mallory", "correct").await;

    assert_eq!(wrong_password.error_code, Some(ErrorCode::InvalidCredentials));
    assert_eq!(wrong_password.error_code, unknown_user.error_code);
    assert_eq!(wrong_password.message, unknown_user.message);
    server.stop().await;
}

// =========================================================================
// Registration
// =========================================================================

#[tokio::test]
async fn test_register_with_auto_login_returns_session() {
    let (server, addr) = start(Server::builder()).await;
    let mut client = Client::connect(addr).await;

    let reply = client
        .request(RegisterRequest {
            username: "bob".into(),
            password: "hunter22".into(),
            auto_login: true,
        })
        .await;

    let Packet::RegisterResponse(response) = reply else {
        panic!("expected RegisterResponse, got {reply:?}");
    };
    assert!(response.success);
    assert!(response.logged_in);
    let token = response.session_token.expect("token");
    assert!(server.sessions().get_by_token(&token).is_some());

    // The new session is usable right away.
    let info = client.request(SessionInfoRequest {}).await;
    assert!(matches!(info, Packet::SessionInfoResponse(_)));
    server.stop().await;
}

#[tokio::test]
async fn test_register_taken_name_returns_username_taken() {
    let (server, addr) = start_with_alice().await;
    let mut client = Client::connect(addr).await;

    let reply = client
        .request(RegisterRequest {
            username: "Alice".into(),
            password: "another1".into(),
            auto_login: false,
        })
        .await;

    assert_eq!(
        reply,
        Packet::RegisterResponse(RegisterResponse {
            success: false,
            error_code: Some(ErrorCode::UsernameTaken),
            message: Some("username is already taken".into()),
            ..Default::default()
        })
    );
    server.stop().await;
}

// =========================================================================
// Auth gating and rebinding
// =========================================================================

#[tokio::test]
async fn test_gated_packet_without_session_returns_unauthorized() {
    let (server, addr) = start_with_alice().await;
    let mut client = Client::connect(addr).await;

    let error = expect_error(client.request(SessionInfoRequest {}).await);

    assert_eq!(error.code, ErrorCode::Unauthorized);
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_on_new_connection_makes_old_connection_stale() {
    let (server, addr) = start_with_alice().await;
    let mut first = Client::connect(addr).await;
    let token = first.login("alice", "correct").await.session_token.unwrap();

    let mut second = Client::connect(addr).await;
    let reply = second
        .request(ReconnectRequest {
            session_token: token.clone(),
        })
        .await;
    let Packet::ReconnectResponse(ReconnectResponse { success, player, .. }) = reply else {
        panic!("expected ReconnectResponse, got {reply:?}");
    };
    assert!(success);
    assert_eq!(player.map(|p| p.username), Some("alice".into()));

    // The old connection is still open but acts as unauthenticated.
    let error = expect_error(first.request(SessionInfoRequest {}).await);
    assert_eq!(error.code, ErrorCode::Unauthorized);

    // The new one owns the session.
    let info = second.request(SessionInfoRequest {}).await;
    let Packet::SessionInfoResponse(SessionInfoResponse { status, player, .. }) = info else {
        panic!("expected SessionInfoResponse, got {info:?}");
    };
    assert_eq!(status, SessionStatus::Online);
    assert_eq!(player.username, "alice");
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_unknown_token_returns_invalid_session() {
    let (server, addr) = start(Server::builder()).await;
    let mut client = Client::connect(addr).await;

    let reply = client
        .request(ReconnectRequest {
            session_token: SessionToken::generate(),
        })
        .await;

    let Packet::ReconnectResponse(response) = reply else {
        panic!("expected ReconnectResponse, got {reply:?}");
    };
    assert!(!response.success);
    assert_eq!(response.error_code, Some(ErrorCode::InvalidSession));
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_keeps_session_for_reconnect() {
    let (server, addr) = start_with_alice().await;
    let mut first = Client::connect(addr).await;
    let token = first.login("alice", "correct").await.session_token.unwrap();
    drop(first);

    // Wait for the server to notice the close and unbind.
    let mut offline = false;
    for _ in 0..100 {
        if let Some(session) = server.sessions().get_by_token(&token) {
            if session.status == SessionStatus::Offline {
                offline = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline, "session should go offline, not away");

    let mut second = Client::connect(addr).await;
    let reply = second.request(ReconnectRequest { session_token: token }).await;
    assert!(matches!(
        reply,
        Packet::ReconnectResponse(ReconnectResponse { success: true, .. })
    ));
    server.stop().await;
}

// =========================================================================
// Protocol errors
// =========================================================================

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (server, addr) = start(Server::builder()).await;
    let mut client = Client::connect(addr).await;

    client.send_raw(b"\xff\x00 definitely not json").await;
    let error = expect_error(client.recv().await.packet);
    assert_eq!(error.code, ErrorCode::MalformedPacket);

    let pong = client.request(Ping { client_time: 42 }).await;
    assert!(matches!(pong, Packet::Pong(Pong { client_time: 42, .. })));
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_tag_returns_unknown_packet_with_correlation_id() {
    let (server, addr) = start(Server::builder()).await;
    let mut client = Client::connect(addr).await;

    client
        .send_raw(br#"{"type":"FlyToMoon","correlationId":"c-1","speed":9000}"#)
        .await;
    let reply = client.recv().await;

    assert_eq!(reply.correlation_id, Some(CorrelationId::from("c-1")));
    assert_eq!(expect_error(reply.packet).code, ErrorCode::UnknownPacket);
    server.stop().await;
}

#[tokio::test]
async fn test_uncorrelated_response_packet_returns_unknown_packet() {
    let (server, addr) = start(Server::builder()).await;
    let mut client = Client::connect(addr).await;

    client.send(&Envelope::new(SessionExpired {})).await;

    assert_eq!(
        expect_error(client.recv().await.packet).code,
        ErrorCode::UnknownPacket
    );
    server.stop().await;
}

// =========================================================================
// Server-initiated requests
// =========================================================================

#[tokio::test]
async fn test_server_request_resolved_by_client_reply() {
    let (server, addr) = start(Server::builder()).await;
    let mut client = Client::connect(addr).await;
    // Round-trip once so the peer is registered.
    client.request(Ping { client_time: 0 }).await;
    let peer = server.peers().pop().expect("one peer");

    let pinger = tokio::spawn(async move {
        let rtt = peer.measure_rtt(Duration::from_secs(2)).await;
        rtt.map(|_| peer)
    });

    let request = client.recv().await;
    let Packet::Ping(ping) = &request.packet else {
        panic!("expected Ping, got {:?}", request.packet);
    };
    let reply = request.reply_to(Pong {
        client_time: ping.client_time,
        server_time: 0,
    });
    client.send(&reply).await;

    let peer = pinger.await.unwrap().expect("rtt ping should succeed");
    assert!(peer.stats().rtt().is_some());
    assert_eq!(peer.pending_requests(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_server_request_without_reply_times_out() {
    let (server, addr) = start(Server::builder()).await;
    let mut client = Client::connect(addr).await;
    client.request(Ping { client_time: 0 }).await;
    let peer = server.peers().pop().expect("one peer");

    let result = peer
        .send_request(Ping { client_time: 1 }, Duration::from_millis(50))
        .await;

    assert!(matches!(result, Err(RequestError::Timeout(_))));
    assert_eq!(peer.pending_requests(), 0);

    // The late reply is dropped quietly, not answered with an error.
    let request = client.recv().await;
    client
        .send(&request.reply_to(Pong {
            client_time: 1,
            server_time: 0,
        }))
        .await;
    client.expect_silence().await;
    server.stop().await;
}

// =========================================================================
// Session expiry
// =========================================================================

#[tokio::test]
async fn test_expired_session_notifies_client_and_gates_again() {
    let builder = Server::builder().session_config(SessionConfig {
        ttl: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(20),
    });
    let (server, addr) = start(builder).await;
    server.auth().register("alice", "correct").await.unwrap();
    let mut client = Client::connect(addr).await;
    client.login("alice", "correct").await;

    let notice = client.recv().await;
    assert_eq!(notice.packet, Packet::SessionExpired(SessionExpired {}));

    let error = expect_error(client.request(SessionInfoRequest {}).await);
    assert_eq!(error.code, ErrorCode::Unauthorized);
    server.stop().await;
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn test_start_twice_returns_already_running() {
    let (server, _addr) = start(Server::builder()).await;

    let second = server.start().await;

    assert!(matches!(
        second,
        Err(LodestarError::AlreadyRunning(ServerStatus::Running))
    ));
    server.stop().await;
}

#[tokio::test]
async fn test_stop_twice_is_noop() {
    let (server, _addr) = start(Server::builder()).await;

    server.stop().await;
    server.stop().await;

    assert_eq!(server.status(), ServerStatus::Stopped);
    assert_eq!(server.local_addr(), None);
}

#[tokio::test]
async fn test_stop_disconnects_clients_and_clears_registries() {
    let (server, addr) = start_with_alice().await;
    let mut client = Client::connect(addr).await;
    client.login("alice", "correct").await;

    server.stop().await;

    let farewell = client.recv().await;
    assert_eq!(
        farewell.packet,
        Packet::Disconnect(Disconnect {
            reason: "server shutting down".into()
        })
    );
    assert!(client.try_recv().await.is_none());
    assert_eq!(server.connection_count(), 0);
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn test_start_after_stop_accepts_again() {
    let (server, _addr) = start(Server::builder()).await;
    server.stop().await;

    let addr = server.start().await.expect("restart");
    let mut client = Client::connect(addr).await;
    let pong = client.request(Ping { client_time: 9 }).await;

    assert!(matches!(pong, Packet::Pong(_)));
    server.stop().await;
}

#[tokio::test]
async fn test_start_on_taken_port_fails_and_stays_stopped() {
    let (first, addr) = start(Server::builder()).await;
    let second = Server::builder().bind(addr).build().unwrap();

    let result = second.start().await;

    assert!(matches!(result, Err(LodestarError::Transport(_))));
    assert_eq!(second.status(), ServerStatus::Stopped);
    first.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let (server, addr) = start(Server::builder().idle_timeout(Duration::from_millis(100))).await;
    let mut client = Client::connect(addr).await;

    let farewell = client.recv().await;

    assert_eq!(
        farewell.packet,
        Packet::Disconnect(Disconnect {
            reason: "idle timeout".into()
        })
    );
    server.stop().await;
}

#[tokio::test]
async fn test_stop_abandons_writes_to_client_that_never_reads() {
    let builder = Server::builder()
        .shutdown_grace(Duration::from_millis(200))
        .handler(PacketType::Ping, false, oversized_reply);
    let (server, addr) = start(builder).await;
    let mut client = Client::connect(addr).await;
    for i in 0..40 {
        let ping = Envelope::correlated(Ping { client_time: i }, CorrelationId::random());
        client.send(&ping).await;
    }
    let peer = single_peer(&server).await;
    // Let the replies back up until the server's write is parked.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    server.stop().await;
    let elapsed = started.elapsed();

    assert_eq!(server.status(), ServerStatus::Stopped);
    assert!(elapsed < Duration::from_secs(3), "stop took {elapsed:?}");
    assert!(peer.is_closed());
    assert_eq!(server.connection_count(), 0);

    // The connection task has exited and dropped its handle.
    let mut released = false;
    for _ in 0..200 {
        if Arc::strong_count(&peer) == 1 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "connection task still holds the peer");
    drop(client);
}

// =========================================================================
// Background pings and handler failures
// =========================================================================

#[tokio::test]
async fn test_ping_interval_pings_client_and_records_rtt() {
    let (server, addr) = start(Server::builder().ping_interval(Duration::from_millis(50))).await;
    let mut client = Client::connect(addr).await;

    let envelope = client.recv().await;
    let Packet::Ping(ping) = &envelope.packet else {
        panic!("expected Ping, got {:?}", envelope.packet);
    };
    assert!(envelope.correlation_id.is_some(), "ping must be a correlated request");
    let reply = envelope.reply_to(Pong {
        client_time: ping.client_time,
        server_time: 0,
    });
    client.send(&reply).await;

    let peer = single_peer(&server).await;
    let mut measured = false;
    for _ in 0..100 {
        if peer.stats().rtt().is_some() {
            measured = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(measured, "rtt should be recorded after the pong");
    server.stop().await;
}

#[tokio::test]
async fn test_handler_error_returns_internal_error_and_keeps_connection() {
    let builder = Server::builder().handler(PacketType::Ping, false, failing_handler);
    let (server, addr) = start(builder).await;
    let mut client = Client::connect(addr).await;

    let error = expect_error(client.request(Ping { client_time: 5 }).await);

    assert_eq!(error.code, ErrorCode::InternalError);
    assert_eq!(error.message, "internal error");
    let reply = client.login("nobody", "secret").await;
    assert!(!reply.success);
    server.stop().await;
}
