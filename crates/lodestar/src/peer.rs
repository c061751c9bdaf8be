//! A connected client: framed transport + request correlation + stats.
//!
//! The [`Peer`] is the server's handle on one accepted socket. It owns the
//! framed connection exclusively; everything else (the dispatch loop, the
//! server's registry, handlers) holds an `Arc<Peer>` and talks to it through
//! `&self` methods.
//!
//! # Correlation
//!
//! Requests and replies share one envelope shape. When the server sends a
//! request ([`Peer::send_request`]) it parks a oneshot sender in `pending`
//! under a fresh correlation id. Every inbound envelope first goes through
//! [`Peer::resolve_reply`]: if its id names a pending entry, the entry is
//! removed and completed; otherwise the envelope is a new request for the
//! handler registry.
//!
//! Each pending entry is completed exactly once. Whoever removes it from
//! the map (reply, timeout, or disconnect) is the one that resolves it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lodestar_protocol::{Codec, CorrelationId, Disconnect, Envelope, Packet, Ping, SessionToken};
use lodestar_transport::{
    Connection, ConnectionId, FRAME_HEADER_LEN, FramedConnection, TransportError,
};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::stats::{ConnectionStats, unix_millis};
use crate::{LodestarError, RequestError};

/// Upper bound on the farewell write and socket close during disconnect.
pub(crate) const FAREWELL_TIMEOUT: Duration = Duration::from_millis(500);

type Waiter = oneshot::Sender<Result<Packet, RequestError>>;

/// One connected client.
pub struct Peer {
    conn: FramedConnection,
    codec: Arc<dyn Codec>,
    pending: DashMap<CorrelationId, Waiter>,
    stats: ConnectionStats,
    /// Non-owning link to the session this connection authenticated as.
    /// The session manager decides whether it is still valid.
    session: RwLock<Option<SessionToken>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Peer {
    /// Wraps an accepted connection.
    ///
    /// `cancel` is usually a child of the server's shutdown token; it fires
    /// when either the server stops or this peer disconnects.
    pub fn new(conn: FramedConnection, codec: Arc<dyn Codec>, cancel: CancellationToken) -> Self {
        Self {
            conn,
            codec,
            pending: DashMap::new(),
            stats: ConnectionStats::new(),
            session: RwLock::new(None),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Fires when this peer should stop reading.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // -- session link -----------------------------------------------------

    /// The token this connection last authenticated with, if any.
    pub fn session_token(&self) -> Option<SessionToken> {
        self.session.read().clone()
    }

    /// Records the session this connection is now acting as. Returns the
    /// previous token.
    pub fn set_session(&self, token: SessionToken) -> Option<SessionToken> {
        self.session.write().replace(token)
    }

    pub fn clear_session(&self) -> Option<SessionToken> {
        self.session.write().take()
    }

    /// Clears the session link only if it still names `token`.
    pub fn clear_session_if(&self, token: &SessionToken) -> bool {
        let mut slot = self.session.write();
        if slot.as_ref() == Some(token) {
            *slot = None;
            true
        } else {
            false
        }
    }

    // -- I/O ----------------------------------------------------------------

    /// Reads the next whole frame. `None` means the client closed the stream.
    pub(crate) async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        let frame = self.conn.recv().await?;
        if let Some(frame) = &frame {
            self.stats.record_received(frame.len() + FRAME_HEADER_LEN);
        }
        Ok(frame)
    }

    /// Encodes and writes one envelope.
    ///
    /// # Errors
    /// `AlreadyClosed` after [`disconnect`](Self::disconnect); otherwise
    /// encode or transport failures.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), LodestarError> {
        if self.is_closed() {
            return Err(LodestarError::AlreadyClosed(self.id()));
        }
        self.write(envelope).await
    }

    /// Fire-and-forget send. Returns whether the write was accepted.
    pub async fn send_packet(&self, packet: impl Into<Packet>) -> bool {
        let envelope = Envelope::new(packet);
        match self.send(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(conn_id = %self.id(), error = %e, "send dropped");
                false
            }
        }
    }

    /// Sends a request under a fresh correlation id and waits for the reply.
    pub async fn send_request(
        &self,
        packet: impl Into<Packet>,
        timeout: Duration,
    ) -> Result<Packet, RequestError> {
        self.send_request_with_id(packet, CorrelationId::random(), timeout)
            .await
    }

    /// Like [`send_request`](Self::send_request) with a caller-chosen id.
    ///
    /// # Errors
    /// - `DuplicateCorrelationId`: `correlation_id` is already outstanding
    /// - `Send`: the frame couldn't be written
    /// - `Timeout`: no reply in time; the pending entry is removed
    /// - `ConnectionClosed`: the peer disconnected first
    pub async fn send_request_with_id(
        &self,
        packet: impl Into<Packet>,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<Packet, RequestError> {
        let (tx, mut rx) = oneshot::channel();
        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => return Err(RequestError::DuplicateCorrelationId(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // `disconnect` flips `closed` before draining, so an insert that
        // raced past the drain is caught here.
        if self.is_closed() {
            self.pending.remove(&correlation_id);
            return Err(RequestError::ConnectionClosed);
        }

        let envelope = Envelope::correlated(packet, correlation_id.clone());
        if let Err(e) = self.write(&envelope).await {
            self.pending.remove(&correlation_id);
            return Err(RequestError::Send(e.to_string()));
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed),
            Err(_) => {
                if self.pending.remove(&correlation_id).is_some() {
                    tracing::debug!(conn_id = %self.id(), %correlation_id, ?timeout, "request timed out");
                    Err(RequestError::Timeout(timeout))
                } else {
                    // Someone else removed the entry just as the timer fired;
                    // their result is already on its way.
                    rx.await.unwrap_or(Err(RequestError::ConnectionClosed))
                }
            }
        }
    }

    /// Routes a reply to its waiting request.
    ///
    /// Returns the envelope back if it isn't a reply to anything pending on
    /// this connection.
    pub fn resolve_reply(&self, envelope: Envelope) -> Option<Envelope> {
        let Some(correlation_id) = envelope.correlation_id.as_ref() else {
            return Some(envelope);
        };
        let Some((_, waiter)) = self.pending.remove(correlation_id) else {
            return Some(envelope);
        };
        // The receiver is gone only if its caller was dropped mid-wait.
        let _ = waiter.send(Ok(envelope.packet));
        None
    }

    /// Sends a correlated `Ping` and records the round trip.
    pub async fn measure_rtt(&self, timeout: Duration) -> Result<Duration, RequestError> {
        let started = Instant::now();
        let ping = Ping {
            client_time: unix_millis(),
        };
        match self.send_request(ping, timeout).await? {
            Packet::Pong(_) => {
                let rtt = started.elapsed();
                self.stats.record_rtt(rtt);
                Ok(rtt)
            }
            other => Err(RequestError::UnexpectedReply(other.packet_type())),
        }
    }

    /// Closes the connection.
    ///
    /// Writes a best-effort `Disconnect{reason}`, shuts the socket, fails
    /// every pending request with `ConnectionClosed` and stops the read
    /// loop. The session link is left alone; unbinding it is the server's
    /// job.
    ///
    /// # Errors
    /// `AlreadyClosed` on every call after the first.
    pub async fn disconnect(&self, reason: &str) -> Result<(), LodestarError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(LodestarError::AlreadyClosed(self.id()));
        }
        self.cancel.cancel();

        let farewell = Envelope::new(Disconnect {
            reason: reason.to_string(),
        });
        if tokio::time::timeout(FAREWELL_TIMEOUT, self.write_frame(&farewell))
            .await
            .is_err()
        {
            tracing::debug!(conn_id = %self.id(), "farewell write timed out");
        }
        let _ = tokio::time::timeout(FAREWELL_TIMEOUT, self.conn.close()).await;

        let failed = self.fail_pending();
        tracing::info!(conn_id = %self.id(), reason, failed_requests = failed, "peer disconnected");
        Ok(())
    }

    /// Writes one envelope unless this peer is cancelled first.
    ///
    /// A client that stops reading fills the socket buffer and parks the
    /// write; cancellation abandons it so shutdown isn't held up.
    async fn write(&self, envelope: &Envelope) -> Result<(), LodestarError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(TransportError::ConnectionClosed(
                "write abandoned on shutdown".into(),
            )
            .into()),
            written = self.write_frame(envelope) => written,
        }
    }

    async fn write_frame(&self, envelope: &Envelope) -> Result<(), LodestarError> {
        let bytes = self.codec.encode(envelope)?;
        self.conn.send(&bytes).await?;
        self.stats.record_sent(bytes.len() + FRAME_HEADER_LEN);
        Ok(())
    }

    fn fail_pending(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(RequestError::ConnectionClosed));
                failed += 1;
            }
        }
        failed
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    //! Peer tests over an in-memory duplex pipe.
    //!
    //! The "client" end is a bare `FramedConnection` speaking JSON; a pump
    //! task reads the server end and feeds every frame to `resolve_reply`,
    //! which is what the dispatch loop does in production.

    use std::net::{Ipv4Addr, SocketAddrV4};

    use lodestar_protocol::{JsonCodec, Pong, SessionExpired};
    use lodestar_transport::FrameConfig;

    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000))
    }

    fn framed(stream: tokio::io::DuplexStream) -> FramedConnection {
        let (reader, writer) = tokio::io::split(stream);
        FramedConnection::new(ConnectionId::next(), addr(), reader, writer, &FrameConfig::default())
    }

    /// Returns the server-side peer and the raw client end.
    fn pair() -> (Arc<Peer>, FramedConnection) {
        pair_with_buffer(64 * 1024)
    }

    fn pair_with_buffer(max_buf_size: usize) -> (Arc<Peer>, FramedConnection) {
        let (server, client) = tokio::io::duplex(max_buf_size);
        let peer = Peer::new(framed(server), Arc::new(JsonCodec), CancellationToken::new());
        (Arc::new(peer), framed(client))
    }

    /// Feeds inbound frames to `resolve_reply` until the stream ends.
    fn pump(peer: &Arc<Peer>) -> tokio::task::JoinHandle<()> {
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            while let Ok(Some(frame)) = peer.recv().await {
                if let Ok(envelope) = JsonCodec.decode(&frame) {
                    peer.resolve_reply(envelope);
                }
            }
        })
    }

    async fn client_recv(client: &FramedConnection) -> Envelope {
        let frame = client.recv().await.unwrap().expect("frame");
        JsonCodec.decode(&frame).unwrap()
    }

    async fn client_send(client: &FramedConnection, envelope: &Envelope) {
        client.send(&JsonCodec.encode(envelope).unwrap()).await.unwrap();
    }

    // =====================================================================
    // send_request()
    // =====================================================================

    #[tokio::test]
    async fn test_send_request_reply_resolves_with_packet() {
        let (peer, client) = pair();
        pump(&peer);

        let requester = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                peer.send_request(Ping { client_time: 1 }, Duration::from_secs(2))
                    .await
            })
        };

        let request = client_recv(&client).await;
        assert!(request.correlation_id.is_some());
        let reply = request.reply_to(Pong {
            client_time: 1,
            server_time: 2,
        });
        client_send(&client, &reply).await;

        let packet = requester.await.unwrap().unwrap();
        assert_eq!(
            packet,
            Packet::Pong(Pong {
                client_time: 1,
                server_time: 2
            })
        );
        assert_eq!(peer.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_request_out_of_order_replies_reach_right_waiters() {
        let (peer, client) = pair();
        pump(&peer);

        let spawn_request = |time: u64| {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                peer.send_request(Ping { client_time: time }, Duration::from_secs(2))
                    .await
            })
        };
        let first = spawn_request(1);
        let second = spawn_request(2);

        let a = client_recv(&client).await;
        let b = client_recv(&client).await;
        for request in [b, a] {
            let Packet::Ping(ping) = &request.packet else {
                panic!("expected ping");
            };
            let reply = request.reply_to(Pong {
                client_time: ping.client_time,
                server_time: 0,
            });
            client_send(&client, &reply).await;
        }

        for (handle, time) in [(first, 1), (second, 2)] {
            match handle.await.unwrap().unwrap() {
                Packet::Pong(pong) => assert_eq!(pong.client_time, time),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_request_no_reply_times_out_and_removes_entry() {
        let (peer, _client) = pair();

        for _ in 0..3 {
            let result = peer
                .send_request(Ping { client_time: 0 }, Duration::from_millis(20))
                .await;
            assert!(matches!(result, Err(RequestError::Timeout(_))));
        }

        assert_eq!(peer.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_request_duplicate_id_rejected() {
        let (peer, _client) = pair();
        let id = CorrelationId::from("dup");

        let first = {
            let peer = Arc::clone(&peer);
            let id = id.clone();
            tokio::spawn(async move {
                peer.send_request_with_id(Ping { client_time: 0 }, id, Duration::from_secs(2))
                    .await
            })
        };
        while peer.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        let second = peer
            .send_request_with_id(Ping { client_time: 0 }, id.clone(), Duration::from_secs(2))
            .await;
        assert!(matches!(second, Err(RequestError::DuplicateCorrelationId(dup)) if dup == id));

        peer.disconnect("test over").await.unwrap();
        assert!(matches!(
            first.await.unwrap(),
            Err(RequestError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_late_reply_after_timeout_is_not_consumed() {
        let (peer, _client) = pair();
        let id = CorrelationId::from("late");

        let result = peer
            .send_request_with_id(Ping { client_time: 0 }, id.clone(), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(RequestError::Timeout(_))));

        let late = Envelope::correlated(
            Pong {
                client_time: 0,
                server_time: 0,
            },
            id,
        );
        assert!(peer.resolve_reply(late).is_some());
    }

    // =====================================================================
    // disconnect()
    // =====================================================================

    #[tokio::test]
    async fn test_disconnect_fails_every_pending_request_once() {
        let (peer, client) = pair();

        let requests: Vec<_> = (0..5)
            .map(|i| {
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    peer.send_request(Ping { client_time: i }, Duration::from_secs(5))
                        .await
                })
            })
            .collect();
        for _ in 0..5 {
            client_recv(&client).await;
        }

        peer.disconnect("bye").await.unwrap();

        for request in requests {
            assert!(matches!(
                request.await.unwrap(),
                Err(RequestError::ConnectionClosed)
            ));
        }
        assert_eq!(peer.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_writes_farewell_then_eof() {
        let (peer, client) = pair();

        peer.disconnect("server shutting down").await.unwrap();

        let farewell = client_recv(&client).await;
        assert_eq!(
            farewell.packet,
            Packet::Disconnect(Disconnect {
                reason: "server shutting down".into()
            })
        );
        assert!(client.recv().await.unwrap().is_none());
        assert!(peer.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_disconnect_twice_returns_already_closed() {
        let (peer, _client) = pair();
        peer.disconnect("once").await.unwrap();

        let second = peer.disconnect("twice").await;
        assert!(matches!(second, Err(LodestarError::AlreadyClosed(id)) if id == peer.id()));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails_fast() {
        let (peer, _client) = pair();
        peer.disconnect("done").await.unwrap();

        assert!(!peer.send_packet(SessionExpired {}).await);
        let request = peer
            .send_request(Ping { client_time: 0 }, Duration::from_secs(5))
            .await;
        assert!(matches!(request, Err(RequestError::ConnectionClosed)));
    }

    // =====================================================================
    // session link / stats
    // =====================================================================

    #[tokio::test]
    async fn test_clear_session_if_ignores_other_token() {
        let (peer, _client) = pair();
        let token = SessionToken::generate();
        peer.set_session(token.clone());

        assert!(!peer.clear_session_if(&SessionToken::generate()));
        assert_eq!(peer.session_token(), Some(token.clone()));
        assert!(peer.clear_session_if(&token));
        assert_eq!(peer.session_token(), None);
    }

    #[tokio::test]
    async fn test_measure_rtt_records_round_trip() {
        let (peer, client) = pair();
        pump(&peer);

        let echo = tokio::spawn(async move {
            let request = client_recv(&client).await;
            let Packet::Ping(ping) = &request.packet else {
                panic!("expected ping");
            };
            let reply = request.reply_to(Pong {
                client_time: ping.client_time,
                server_time: 0,
            });
            client_send(&client, &reply).await;
            client
        });

        let rtt = peer.measure_rtt(Duration::from_secs(2)).await.unwrap();
        let _client = echo.await.unwrap();

        assert_eq!(peer.stats().rtt().map(|d| d.as_millis()), Some(rtt.as_millis()));
        let snapshot = peer.stats().snapshot();
        assert_eq!(snapshot.packets_sent, 1);
        assert_eq!(snapshot.packets_received, 1);
    }

    #[tokio::test]
    async fn test_send_packet_counts_length_prefix_in_bytes() {
        let (peer, client) = pair();

        assert!(peer.send_packet(SessionExpired {}).await);
        let _ = client_recv(&client).await;

        let payload = JsonCodec.encode(&Envelope::new(SessionExpired {})).unwrap();
        let snapshot = peer.stats().snapshot();
        assert_eq!(snapshot.bytes_sent, (payload.len() + FRAME_HEADER_LEN) as u64);
        assert_eq!(snapshot.packets_sent, 1);
    }

    #[tokio::test]
    async fn test_send_blocked_on_full_socket_returns_on_cancel() {
        let (peer, _client) = pair_with_buffer(64);

        let sender = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                let big = Disconnect {
                    reason: "x".repeat(16 * 1024),
                };
                peer.send(&Envelope::new(big)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished(), "write should be parked on the full pipe");

        peer.cancellation().cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .expect("cancelled write must return")
            .unwrap();

        assert!(matches!(
            result,
            Err(LodestarError::Transport(TransportError::ConnectionClosed(_)))
        ));
        assert_eq!(peer.stats().snapshot().packets_sent, 0);
    }
}
