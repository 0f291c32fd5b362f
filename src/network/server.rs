//! WebSocket Game Server
//!
//! Async WebSocket server for wagering clients, plus the HTTP API and the
//! background tasks that drive play.
//!
//! ```text
//!  ┌────────────── GameServer::run ───────────────┐
//!  │  ws accept loop ──► connection task (1/peer) │
//!  │  ApiServer      ──► /api/balance[/stream] …  │
//!  │  RoundEngine    ──► rounds, back to back     │
//!  │  Publisher      ──► per-user live updates    │
//!  └──────────────── shutdown_tx ─────────────────┘
//! ```
//!
//! Connections never touch the round directly; bets and cash-outs go through
//! the [`RoundHandle`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::fair::seed::SeedManager;
use crate::ledger::balance::UserId;
use crate::ledger::book::BalanceLedger;
use crate::network::auth::Authenticator;
use crate::network::http::{ApiServer, ApiState, HttpError};
use crate::network::protocol::{
    AuthRequest, AuthResult, BalanceView, BetResult, CashOutResult, ClientMessage, CompactCommand, ErrorCode,
    PlaceBetRequest, ServerMessage,
};
use crate::network::publisher::{LiveUpdatePublisher, PublisherConfig, StreamEvent};
use crate::round::engine::{EngineConfig, EngineError, RoundEngine, RoundHandle};
use crate::round::state::RoundError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub ws_bind_addr: SocketAddr,
    /// HTTP API bind address.
    pub http_bind_addr: SocketAddr,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Unauthenticated connections are closed after this long.
    pub auth_timeout: Duration,
    /// Public client seed for the provably-fair derivation.
    pub client_seed: String,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            http_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            max_connections: 1000,
            auth_timeout: Duration::from_secs(30),
            client_seed: "crash-wager-public-seed".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ws_bind_addr: std::env::var("SERVER_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ws_bind_addr),
            http_bind_addr: std::env::var("HTTP_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_bind_addr),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            client_seed: std::env::var("CLIENT_SEED").unwrap_or(defaults.client_seed),
            ..defaults
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP listener failed.
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// The round engine halted.
    #[error("Engine halted: {0}")]
    Engine(#[from] EngineError),

    /// `run` was called twice.
    #[error("Server already running")]
    AlreadyRunning,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Connected client state.
struct ConnectedClient {
    /// User identifier (after auth).
    user_id: Option<UserId>,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
}

/// Everything a connection task needs.
struct Shared {
    config: ServerConfig,
    ledger: Arc<BalanceLedger>,
    seeds: Arc<SeedManager>,
    rounds: RoundHandle,
    publisher: Arc<LiveUpdatePublisher>,
    auth: Arc<Authenticator>,
    clients: RwLock<BTreeMap<SocketAddr, ConnectedClient>>,
}

/// Per-connection session.
struct Session {
    addr: SocketAddr,
    user_id: Option<UserId>,
    balance_feed: Option<JoinHandle<()>>,
    sender: mpsc::Sender<ServerMessage>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(feed) = self.balance_feed.take() {
            feed.abort();
        }
    }
}

/// The game server.
pub struct GameServer {
    shared: Arc<Shared>,
    engine: Mutex<Option<RoundEngine>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(
        config: ServerConfig,
        engine_config: EngineConfig,
        publisher_config: PublisherConfig,
        auth: Authenticator,
    ) -> Self {
        let ledger = Arc::new(BalanceLedger::new());
        let seeds = Arc::new(SeedManager::with_os_entropy(config.client_seed.clone()));
        Self::with_parts(config, engine_config, publisher_config, auth, ledger, seeds)
    }

    /// Create a server over an existing ledger and seed manager.
    pub fn with_parts(
        config: ServerConfig,
        engine_config: EngineConfig,
        publisher_config: PublisherConfig,
        auth: Authenticator,
        ledger: Arc<BalanceLedger>,
        seeds: Arc<SeedManager>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (engine, rounds) = RoundEngine::new(engine_config, seeds.clone(), ledger.clone());
        let publisher = Arc::new(LiveUpdatePublisher::new(publisher_config, ledger.clone()));

        Self {
            shared: Arc::new(Shared {
                config,
                ledger,
                seeds,
                rounds,
                publisher,
                auth: Arc::new(auth),
                clients: RwLock::new(BTreeMap::new()),
            }),
            engine: Mutex::new(Some(engine)),
            shutdown_tx,
        }
    }

    /// Bind the configured addresses and run.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let ws_listener = TcpListener::bind(&self.shared.config.ws_bind_addr).await?;
        let http_listener = TcpListener::bind(&self.shared.config.http_bind_addr).await?;
        self.run_with_listeners(ws_listener, http_listener).await
    }

    /// Run on already-bound listeners until shutdown or an engine halt.
    pub async fn run_with_listeners(
        &self,
        ws_listener: TcpListener,
        http_listener: TcpListener,
    ) -> Result<(), GameServerError> {
        let engine = self.engine.lock().await.take().ok_or(GameServerError::AlreadyRunning)?;
        info!("Game server listening on {}", ws_listener.local_addr()?);
        if !self.shared.auth.is_configured() {
            warn!("Authentication not configured; declared user ids are trusted");
        }

        // Subscribe before any task can emit
        let publisher = self.shared.publisher.clone();
        let publisher_handle = tokio::spawn(publisher.run(
            self.shared.ledger.subscribe(),
            self.shared.rounds.subscribe(),
            self.shutdown_tx.subscribe(),
        ));

        let api = ApiServer::new(
            Arc::new(ApiState {
                ledger: self.shared.ledger.clone(),
                publisher: self.shared.publisher.clone(),
                rounds: self.shared.rounds.clone(),
                seeds: self.shared.seeds.clone(),
                auth: self.shared.auth.clone(),
            }),
            self.shutdown_tx.clone(),
        );
        let http_handle = tokio::spawn(async move {
            if let Err(e) = api.run(http_listener).await {
                error!("HTTP API stopped: {}", e);
            }
        });

        let mut engine_handle = tokio::spawn(engine.run(self.shutdown_tx.subscribe()));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let halted = loop {
            tokio::select! {
                result = ws_listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.shared.clients.read().await.len();
                            if clients_count >= self.shared.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                result = &mut engine_handle => {
                    // Engine only returns on its own for fatal errors
                    let _ = self.shutdown_tx.send(());
                    break Some(result);
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break None;
                }
            }
        };

        // Let the engine finish the round in progress
        let engine_result = match halted {
            Some(result) => result,
            None => engine_handle.await,
        };
        let _ = publisher_handle.await;
        let _ = http_handle.await;

        match engine_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Round engine halted: {}", e);
                Err(GameServerError::Engine(e))
            }
            Err(e) => Err(GameServerError::Internal(format!("engine task failed: {}", e))),
        }
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Register client
            {
                let mut clients = shared.clients.write().await;
                clients.insert(addr, ConnectedClient {
                    user_id: None,
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                });
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let round_task = tokio::spawn(Self::forward_round_events(shared.rounds.clone(), msg_tx.clone()));

            let mut session = Session {
                addr,
                user_id: None,
                balance_feed: None,
                sender: msg_tx.clone(),
            };
            let auth_deadline = tokio::time::sleep(shared.config.auth_timeout);
            tokio::pin!(auth_deadline);

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };
                                Self::touch(&shared, addr).await;
                                Self::handle_client_message(&shared, &mut session, client_msg).await;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                match CompactCommand::from_bytes(&data) {
                                    Ok(command) => {
                                        Self::touch(&shared, addr).await;
                                        Self::handle_client_message(&shared, &mut session, command.into_message()).await;
                                    }
                                    Err(e) => debug!("Invalid binary frame from {}: {}", addr, e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut auth_deadline, if session.user_id.is_none() => {
                        let _ = msg_tx.send(ServerMessage::error(
                            ErrorCode::NotAuthenticated,
                            "Authentication timeout",
                        )).await;
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            round_task.abort();
            drop(session);
            drop(msg_tx);
            // Flush queued replies, then stop the writer
            let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;

            if let Some(client) = shared.clients.write().await.remove(&addr) {
                info!(
                    user = ?client.user_id.as_ref().map(UserId::as_str),
                    connected_secs = client.connected_at.elapsed().as_secs(),
                    idle_secs = client.last_activity.elapsed().as_secs(),
                    "Client {} cleaned up",
                    addr
                );
            }
        });
    }

    async fn touch(shared: &Shared, addr: SocketAddr) {
        let mut clients = shared.clients.write().await;
        if let Some(client) = clients.get_mut(&addr) {
            client.last_activity = Instant::now();
        }
    }

    /// Forward round events; resync with a snapshot after lagging.
    async fn forward_round_events(rounds: RoundHandle, sender: mpsc::Sender<ServerMessage>) {
        let mut events = rounds.subscribe();
        loop {
            let msg = match events.recv().await {
                Ok(event) => ServerMessage::Round(event),
                Err(RecvError::Lagged(_)) => match rounds.snapshot() {
                    Some(snapshot) => ServerMessage::RoundState(snapshot),
                    None => continue,
                },
                Err(RecvError::Closed) => break,
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    }

    /// Forward one user's balance snapshots.
    async fn forward_balance(publisher: Arc<LiveUpdatePublisher>, user_id: UserId, sender: mpsc::Sender<ServerMessage>) {
        let mut sub = publisher.subscribe(user_id.clone()).await;
        while let Some(event) = sub.events.recv().await {
            let StreamEvent::Balance(snapshot) = event else {
                continue;
            };
            let view = BalanceView {
                ton: snapshot.ton,
                stars: snapshot.stars,
                version: snapshot.version,
            };
            if sender.send(ServerMessage::Balance(view)).await.is_err() {
                break;
            }
        }
        publisher.unsubscribe(&user_id, sub.id).await;
    }

    /// Handle a client message.
    async fn handle_client_message(shared: &Arc<Shared>, session: &mut Session, msg: ClientMessage) {
        match msg {
            ClientMessage::Auth(auth) => {
                Self::handle_auth(shared, session, auth).await;
            }
            ClientMessage::PlaceBet(req) => {
                Self::handle_place_bet(shared, session, req).await;
            }
            ClientMessage::CashOut { user_id } => {
                Self::handle_cash_out(shared, session, user_id).await;
            }
            ClientMessage::SyncRequest => {
                if let Some(snapshot) = shared.rounds.snapshot() {
                    let _ = session.sender.send(ServerMessage::RoundState(snapshot)).await;
                }
                if let Some(ref user_id) = session.user_id {
                    let balance = shared.ledger.read(user_id).await;
                    let _ = session.sender.send(ServerMessage::Balance(BalanceView::from(&balance))).await;
                }
            }
            ClientMessage::AuditRequest { nonce } => {
                let records = match nonce {
                    Some(nonce) => shared.seeds.audit_record(nonce).await.into_iter().collect(),
                    None => shared.seeds.audit_log().await,
                };
                let _ = session.sender.send(ServerMessage::Audit { records }).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = session.sender.send(ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
                }).await;
            }
        }
    }

    /// Handle authentication.
    async fn handle_auth(shared: &Arc<Shared>, session: &mut Session, auth: AuthRequest) {
        let result = shared.auth.authorize(Some(&auth.user_id), auth.token.as_deref());
        let user_id = match result {
            Ok(user_id) => user_id,
            Err(e) => {
                debug!("Client {} failed auth: {}", session.addr, e);
                let _ = session.sender.send(ServerMessage::AuthResult(AuthResult {
                    success: false,
                    user_id: None,
                    error: Some(e.to_string()),
                    server_version: shared.config.version.clone(),
                })).await;
                return;
            }
        };

        {
            let mut clients = shared.clients.write().await;
            if let Some(client) = clients.get_mut(&session.addr) {
                client.user_id = Some(user_id.clone());
            }
        }

        let _ = session.sender.send(ServerMessage::AuthResult(AuthResult {
            success: true,
            user_id: Some(user_id.to_string()),
            error: None,
            server_version: shared.config.version.clone(),
        })).await;

        // Re-auth switches the balance feed to the new identity
        if let Some(feed) = session.balance_feed.take() {
            feed.abort();
        }
        session.balance_feed = Some(tokio::spawn(Self::forward_balance(
            shared.publisher.clone(),
            user_id.clone(),
            session.sender.clone(),
        )));

        debug!("Client {} authenticated as {}", session.addr, user_id);
        session.user_id = Some(user_id);
    }

    /// The session user, checked against a declared id.
    async fn acting_user(session: &Session, declared: Option<&str>) -> Option<UserId> {
        let Some(ref user_id) = session.user_id else {
            let _ = session.sender.send(ServerMessage::error(
                ErrorCode::NotAuthenticated,
                "Must authenticate first",
            )).await;
            return None;
        };
        if declared.is_some_and(|id| !id.is_empty() && id != user_id.as_str()) {
            let _ = session.sender.send(ServerMessage::error(
                ErrorCode::UserMismatch,
                "userId does not match the authenticated user",
            )).await;
            return None;
        }
        Some(user_id.clone())
    }

    /// Handle bet placement.
    async fn handle_place_bet(shared: &Arc<Shared>, session: &Session, req: PlaceBetRequest) {
        let Some(user_id) = Self::acting_user(session, req.user_id.as_deref()).await else {
            return;
        };
        let result = match req.stake_amount() {
            Some(stake) => shared.rounds.place_bet(user_id, stake, req.currency).await,
            None => Err(RoundError::InvalidStake),
        };
        if let Err(e) = &result {
            debug!(addr = %session.addr, reason = e.code(), "Bet rejected");
        }
        let _ = session.sender.send(ServerMessage::BetResult(BetResult::from_result(&result))).await;
    }

    /// Handle cash-out.
    async fn handle_cash_out(shared: &Arc<Shared>, session: &Session, declared: Option<String>) {
        let Some(user_id) = Self::acting_user(session, declared.as_deref()).await else {
            return;
        };
        let result = shared.rounds.cash_out(user_id).await;
        if let Err(e) = &result {
            debug!(addr = %session.addr, reason = e.code(), "Cash-out rejected");
        }
        let _ = session.sender.send(ServerMessage::CashOutResult(CashOutResult::from_result(&result))).await;
    }

    /// Shutdown the server. The round in progress settles first.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get connected client count.
    pub async fn connection_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }

    /// The balance ledger.
    pub fn ledger(&self) -> Arc<BalanceLedger> {
        self.shared.ledger.clone()
    }

    /// The round engine handle.
    pub fn rounds(&self) -> RoundHandle {
        self.shared.rounds.clone()
    }
}
