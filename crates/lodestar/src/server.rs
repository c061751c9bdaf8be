//! `Server` builder, lifecycle and background loops.
//!
//! This is the entry point for running a Lodestar server. It ties together
//! all the layers: transport → protocol → session → dispatch.
//!
//! ```text
//!            start()                      stop()
//! Stopped ──────────→ Starting ──→ Running ──────→ Stopping ──→ Stopped
//!    ▲                   │ (bind failed)
//!    └───────────────────┘
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use lodestar_protocol::{Codec, JsonCodec, PacketType, SessionExpired};
use lodestar_session::{
    AuthConfig, AuthService, MemoryPlayerStore, PasswordHasher, PlayerStore, SessionConfig,
    SessionManager, Sha256PasswordHasher,
};
use lodestar_transport::{ConnectionId, FrameConfig, TcpTransport, Transport};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::handler::handle_connection;
use crate::peer::FAREWELL_TIMEOUT;
use crate::registry::{HandlerEntry, HandlerFn, HandlerRegistry};
use crate::{LodestarError, Peer, handlers};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 7777;

/// How long `stop` waits for connection tasks after forcing disconnects.
/// Covers one farewell write and one socket close, each bounded by the
/// peer's farewell timeout.
const FORCED_STOP_WAIT: Duration =
    FAREWELL_TIMEOUT.saturating_mul(2).saturating_add(Duration::from_millis(100));

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Server-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where to listen. Default: `127.0.0.1:7777`.
    pub bind_addr: SocketAddr,

    /// Framing limits for every connection.
    pub frame: FrameConfig,

    /// Timeout for server-initiated requests (RTT pings). Default: 10 s.
    pub request_timeout: Duration,

    /// A connection that sends nothing for this long is closed.
    /// Default: 5 minutes.
    pub idle_timeout: Duration,

    /// If set, every connection is pinged at this interval to keep its
    /// RTT current. Default: off.
    pub ping_interval: Option<Duration>,

    /// How long `stop` waits for connection tasks to finish. Default: 5 s.
    pub shutdown_grace: Duration,

    /// Pause after a failed `accept` before retrying. Default: 100 ms.
    pub accept_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            frame: FrameConfig::default(),
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5 * 60),
            ping_interval: None,
            shutdown_grace: Duration::from_secs(5),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by the accept loop, every connection task and handlers.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. Every map is
/// concurrent; nothing here is held across an `.await`.
pub struct ServerState {
    config: ServerConfig,
    codec: Arc<dyn Codec>,
    handlers: HandlerRegistry,
    sessions: Arc<SessionManager>,
    auth: Arc<AuthService>,
    pub(crate) peers: DashMap<ConnectionId, Arc<Peer>>,
}

impl ServerState {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    /// A live connection by id.
    pub fn peer(&self, id: ConnectionId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every live connection.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring a Lodestar server.
///
/// # Example
///
/// ```rust,no_run
/// use lodestar::prelude::*;
///
/// # async fn run() -> Result<(), LodestarError> {
/// let server = Server::builder()
///     .bind(([0, 0, 0, 0], 7777))
///     .player_store(MemoryPlayerStore::new())
///     .build()?;
/// let addr = server.start().await?;
/// println!("listening on {addr}");
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    session_config: SessionConfig,
    auth_config: AuthConfig,
    store: Option<Arc<dyn PlayerStore>>,
    hasher: Option<Arc<dyn PasswordHasher>>,
    codec: Arc<dyn Codec>,
    extra_handlers: Vec<HandlerEntry>,
}

impl ServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            session_config: SessionConfig::default(),
            auth_config: AuthConfig::default(),
            store: None,
            hasher: None,
            codec: Arc::new(JsonCodec),
            extra_handlers: Vec::new(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Replaces the whole server config.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn frame_config(mut self, frame: FrameConfig) -> Self {
        self.config.frame = frame;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = Some(interval);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Sets the session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn auth_config(mut self, config: AuthConfig) -> Self {
        self.auth_config = config;
        self
    }

    /// Where player accounts live. Default: an empty [`MemoryPlayerStore`].
    pub fn player_store(mut self, store: impl PlayerStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// How passwords are hashed. Default: [`Sha256PasswordHasher`].
    pub fn password_hasher(mut self, hasher: impl PasswordHasher) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    /// Wire encoding. Default: [`JsonCodec`].
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Adds a handler, replacing the built-in one for the same tag.
    pub fn handler(
        mut self,
        packet_type: PacketType,
        requires_auth: bool,
        handler: HandlerFn,
    ) -> Self {
        self.extra_handlers.push(HandlerEntry {
            packet_type,
            requires_auth,
            handler,
        });
        self
    }

    /// Wires everything together. Doesn't bind yet; see [`Server::start`].
    ///
    /// # Errors
    /// `DuplicateHandler` if [`handler`](Self::handler) was called twice
    /// for one tag.
    pub fn build(self) -> Result<Server, LodestarError> {
        let mut table: Vec<HandlerEntry> = handlers::builtin()
            .into_iter()
            .filter(|builtin| {
                !self
                    .extra_handlers
                    .iter()
                    .any(|extra| extra.packet_type == builtin.packet_type)
            })
            .collect();
        table.extend(self.extra_handlers);
        let registry = HandlerRegistry::new(table)?;

        let sessions = Arc::new(SessionManager::new(self.session_config));
        let auth = Arc::new(AuthService::new(
            self.store
                .unwrap_or_else(|| Arc::new(MemoryPlayerStore::new())),
            self.hasher.unwrap_or_else(|| Arc::new(Sha256PasswordHasher)),
            Arc::clone(&sessions),
            self.auth_config,
        ));

        let state = Arc::new(ServerState {
            config: self.config,
            codec: self.codec,
            handlers: registry,
            sessions,
            auth,
            peers: DashMap::new(),
        });

        Ok(Server {
            state,
            status: Mutex::new(ServerStatus::Stopped),
            running: Mutex::new(None),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Handles for one started instance.
struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// A Lodestar server.
///
/// [`start`](Self::start) binds and spawns the accept loop;
/// [`stop`](Self::stop) tears everything down. A stopped server can be
/// started again.
pub struct Server {
    state: Arc<ServerState>,
    status: Mutex<ServerStatus>,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// Creates a new builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.state.sessions()
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        self.state.auth()
    }

    pub fn peer(&self, id: ConnectionId) -> Option<Arc<Peer>> {
        self.state.peer(id)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.peers()
    }

    pub fn connection_count(&self) -> usize {
        self.state.peers.len()
    }

    /// Binds the listener and spawns the accept, sweep and (optional) ping
    /// loops. Returns the bound address.
    ///
    /// # Errors
    /// - `AlreadyRunning` unless the server is `Stopped`
    /// - `Transport(BindFailed)` if the address can't be bound; the server
    ///   goes back to `Stopped`
    pub async fn start(&self) -> Result<SocketAddr, LodestarError> {
        {
            let mut status = self.status.lock();
            if *status != ServerStatus::Stopped {
                return Err(LodestarError::AlreadyRunning(*status));
            }
            *status = ServerStatus::Starting;
        }

        let config = self.state.config();
        let bound = match TcpTransport::bind(config.bind_addr, config.frame.clone()).await {
            Ok(transport) => transport.local_addr().map(|addr| (transport, addr)),
            Err(e) => Err(e),
        };
        let (transport, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                *self.status.lock() = ServerStatus::Stopped;
                tracing::error!(addr = %config.bind_addr, error = %e, "server failed to start");
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            transport,
            Arc::clone(&self.state),
            cancel.clone(),
            tracker.clone(),
        ));
        tracker.spawn(sweep_loop(Arc::clone(&self.state), cancel.clone()));
        if let Some(interval) = config.ping_interval {
            tracker.spawn(ping_loop(
                Arc::clone(&self.state),
                interval,
                cancel.clone(),
                tracker.clone(),
            ));
        }

        *self.running.lock() = Some(Running {
            cancel,
            tracker,
            local_addr,
        });
        *self.status.lock() = ServerStatus::Running;

        tracing::info!(%local_addr, "Lodestar server running");
        Ok(local_addr)
    }

    /// Stops accepting, disconnects every connection, waits for their tasks
    /// (up to `shutdown_grace`) and clears the registries.
    ///
    /// Safe to call any number of times; only a `Running` server does
    /// anything.
    pub async fn stop(&self) {
        let running = {
            let mut status = self.status.lock();
            if *status != ServerStatus::Running {
                return;
            }
            *status = ServerStatus::Stopping;
            self.running.lock().take()
        };
        let Some(running) = running else {
            *self.status.lock() = ServerStatus::Stopped;
            return;
        };

        tracing::info!(connections = self.state.peers.len(), "Lodestar server stopping");

        // Every connection task sees this through its child token and
        // disconnects with "server shutting down".
        running.cancel.cancel();
        running.tracker.close();

        let grace = self.state.config().shutdown_grace;
        if tokio::time::timeout(grace, running.tracker.wait())
            .await
            .is_err()
        {
            let stragglers = self.state.peers();
            tracing::warn!(
                ?grace,
                tasks = running.tracker.len(),
                stragglers = stragglers.len(),
                "shutdown grace elapsed, forcing disconnects"
            );
            join_all(
                stragglers
                    .iter()
                    .map(|peer| peer.disconnect("server shutting down")),
            )
            .await;

            // A task already inside its own disconnect may still be spending
            // its farewell budget.
            if tokio::time::timeout(FORCED_STOP_WAIT, running.tracker.wait())
                .await
                .is_err()
            {
                tracing::error!(
                    tasks = running.tracker.len(),
                    "connection tasks still running after forced disconnect"
                );
            }
        }

        self.state.peers.clear();
        self.state.sessions().clear();
        *self.status.lock() = ServerStatus::Stopped;
        tracing::info!("Lodestar server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Accepts connections until cancelled, one task per connection.
async fn accept_loop(
    transport: TcpTransport,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let backoff = state.config().accept_backoff;
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = transport.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                let peer = Arc::new(Peer::new(
                    conn,
                    Arc::clone(state.codec()),
                    cancel.child_token(),
                ));
                tracing::info!(conn_id = %peer.id(), remote = %peer.remote_addr(), "connection accepted");
                state.peers.insert(peer.id(), Arc::clone(&peer));
                tracker.spawn(handle_connection(peer, Arc::clone(&state)));
            }
            Err(e) => {
                tracing::warn!(error = %e, ?backoff, "accept failed, backing off");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

/// Periodically removes expired sessions (telling their connections) and
/// lapsed failed-login counters.
async fn sweep_loop(state: Arc<ServerState>, cancel: CancellationToken) {
    let period = state
        .sessions()
        .config()
        .sweep_interval
        .max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        notify_expired(&state).await;
        let pruned = state.auth().sweep_failures();
        if pruned > 0 {
            tracing::debug!(pruned, "lapsed failed-login counters dropped");
        }
    }
}

/// One sweep pass: drop expired sessions and notify bound connections.
async fn notify_expired(state: &ServerState) {
    for session in state.sessions().sweep_expired() {
        let Some(conn_id) = session.connection_id else {
            continue;
        };
        let Some(peer) = state.peer(conn_id) else {
            continue;
        };
        if peer.clear_session_if(&session.token) {
            tracing::info!(%conn_id, player_id = %session.player_id, "session expired");
            peer.send_packet(SessionExpired {}).await;
        }
    }
}

/// Probes every connection's RTT at a fixed interval.
async fn ping_loop(
    state: Arc<ServerState>,
    interval: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let timeout = state.config().request_timeout;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for peer in state.peers() {
            tracker.spawn(async move {
                if let Err(e) = peer.measure_rtt(timeout).await {
                    tracing::debug!(conn_id = %peer.id(), error = %e, "rtt ping failed");
                }
            });
        }
    }
}
