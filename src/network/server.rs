//! WebSocket Game Server
//!
//! Async WebSocket front end over the session manager. Clients create and
//! act on sessions, fetch snapshots, and subscribe to push events.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::error::GameError;
use crate::game::session::SessionId;
use crate::network::notifier::SessionChannels;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
use crate::network::session::SessionManager;
use crate::settlement::engine::SettlementEngine;
use crate::settlement::store::UserStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Requests per second allowed per connection.
    pub requests_per_second: u32,
    /// Request burst allowed per connection.
    pub request_burst: u32,
    /// How long finished sessions stay readable.
    pub finished_retention: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            requests_per_second: 10,
            request_burst: 20,
            finished_retention: Duration::from_secs(30 * 60),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Read `CAFE_DUEL_BIND` and `CAFE_DUEL_MAX_CONNECTIONS` over the defaults.
    pub fn from_env() -> Result<Self, GameServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GameServerError> {
        let mut config = Self::default();
        if let Some(bind) = lookup("CAFE_DUEL_BIND") {
            config.bind_addr = bind
                .trim()
                .parse()
                .map_err(|e| GameServerError::Config(format!("CAFE_DUEL_BIND '{bind}': {e}")))?;
        }
        if let Some(max) = lookup("CAFE_DUEL_MAX_CONNECTIONS") {
            config.max_connections = max
                .trim()
                .parse()
                .map_err(|e| GameServerError::Config(format!("CAFE_DUEL_MAX_CONNECTIONS '{max}': {e}")))?;
        }
        Ok(config)
    }

    fn quota(&self) -> Quota {
        let rate = NonZeroU32::new(self.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.request_burst).unwrap_or(rate);
        Quota::per_second(rate).allow_burst(burst)
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

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Connected client state.
struct ConnectedClient {
    /// Connection time.
    connected_at: Instant,
    /// Sessions this connection receives pushes for.
    subscriptions: usize,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Session manager.
    sessions: Arc<SessionManager>,
    /// Push channels.
    channels: Arc<SessionChannels>,
    /// Connected clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server over an account store.
    pub fn new(config: ServerConfig, store: Arc<dyn UserStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let channels = Arc::new(SessionChannels::default());
        let settlement = Arc::new(SettlementEngine::new(store));
        let sessions = Arc::new(SessionManager::new(settlement, channels.clone()));

        Self {
            config,
            sessions,
            channels,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Bind and run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on a bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let cleanup_sessions = self.sessions.clone();
        let retention = self.config.finished_retention;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_sessions, retention).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
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
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let sessions = self.sessions.clone();
        let channels = self.channels.clone();
        let limiter = RateLimiter::direct(self.config.quota());
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

            clients.write().await.insert(addr, ConnectedClient {
                connected_at: Instant::now(),
                subscriptions: 0,
            });

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

            let mut connection = Connection {
                addr,
                sessions,
                channels,
                clients: clients.clone(),
                limiter,
                sender: msg_tx,
                forwarders: BTreeMap::new(),
            };

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => connection.handle(client_msg).await,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        connection
                                            .send(ServerMessage::Error(ServerError::new(
                                                ErrorCode::InvalidInput,
                                                "Invalid message format",
                                            )))
                                            .await;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                connection
                                    .send(ServerMessage::Pong { timestamp: 0, server_time: Utc::now() })
                                    .await;
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
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            connection.close();
            sender_task.abort();

            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    "Client {} cleaned up after {:?} with {} subscriptions",
                    addr,
                    client.connected_at.elapsed(),
                    client.subscriptions
                );
            }
        });
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(sessions: Arc<SessionManager>, retention: Duration) {
        let mut interval = interval(Duration::from_secs(60));

        loop {
            interval.tick().await;
            let cutoff = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|r| Utc::now().checked_sub_signed(r));
            if let Some(cutoff) = cutoff {
                let pruned = sessions.prune_finished(cutoff).await;
                if pruned > 0 {
                    debug!(pruned, "Pruned finished sessions");
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }
}

/// Per-connection handler state.
struct Connection {
    addr: SocketAddr,
    sessions: Arc<SessionManager>,
    channels: Arc<SessionChannels>,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    limiter: DefaultDirectRateLimiter,
    sender: mpsc::Sender<ServerMessage>,
    forwarders: BTreeMap<SessionId, JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.sender.send(msg).await;
    }

    async fn reply(&self, result: Result<ServerMessage, GameError>) {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                debug!("Request from {} rejected: {}", self.addr, err);
                ServerMessage::Error(ServerError::from(&err))
            }
        };
        self.send(msg).await;
    }

    /// Rate-limit check; `Err` carries the back-off.
    fn admit(&self) -> Result<(), GameError> {
        self.limiter.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            GameError::RateLimited { retry_after_ms: (wait.as_millis() as u64).max(1) }
        })
    }

    async fn handle(&mut self, msg: ClientMessage) {
        if let ClientMessage::Ping { timestamp } = msg {
            self.send(ServerMessage::Pong { timestamp, server_time: Utc::now() }).await;
            return;
        }
        if let Err(err) = self.admit() {
            warn!("Rate limited {}", self.addr);
            self.reply(Err(err)).await;
            return;
        }

        let now = Utc::now();
        let result = match msg {
            ClientMessage::Subscribe { session_id } => self.subscribe(session_id).await,
            ClientMessage::Snapshot { session_id } => self
                .sessions
                .snapshot(session_id, now)
                .await
                .map(|snapshot| ServerMessage::Snapshot { snapshot }),
            ClientMessage::Create(request) => self
                .sessions
                .create(request, now)
                .await
                .map(|snapshot| ServerMessage::Snapshot { snapshot }),
            ClientMessage::Act { session_id, identity, action } => self
                .sessions
                .dispatch(session_id, &identity, action, now)
                .await
                .map(ServerMessage::Ack),
            ClientMessage::ListOpen { table } => Ok(ServerMessage::Sessions {
                sessions: self.sessions.list_open(table.as_deref(), now).await,
            }),
            ClientMessage::ActiveSession { identity } => self
                .sessions
                .active_session_for(&identity, now)
                .await
                .map(|found| ServerMessage::Sessions { sessions: found.into_iter().collect() }),
            ClientMessage::Ping { .. } => return,
        };
        self.reply(result).await;
    }

    async fn subscribe(&mut self, session_id: SessionId) -> Result<ServerMessage, GameError> {
        let snapshot = self.sessions.snapshot(session_id, Utc::now()).await?;
        if !self.forwarders.contains_key(&session_id) {
            let mut rx = self.channels.subscribe(session_id).await;
            let sender = self.sender.clone();
            let addr = self.addr;
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if sender.send(ServerMessage::Push { event }).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!("Subscriber {} lagged by {} events", addr, missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            self.forwarders.insert(session_id, handle);
            if let Some(client) = self.clients.write().await.get_mut(&self.addr) {
                client.subscriptions = self.forwarders.len();
            }
        }

        self.send(ServerMessage::Subscribed { session_id }).await;
        Ok(ServerMessage::Snapshot { snapshot })
    }

    fn close(&mut self) {
        for (_, handle) in std::mem::take(&mut self.forwarders) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::session::{GameType, SessionStatus};
    use crate::network::protocol::{CreateRequest, SessionAction};
    use crate::settlement::store::{MemoryUserStore, UserRecord};
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn test_server_config_lookup() {
        let config = ServerConfig::from_lookup(|key| match key {
            "CAFE_DUEL_BIND" => Some("127.0.0.1:9100".to_string()),
            "CAFE_DUEL_MAX_CONNECTIONS" => Some(" 12 ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.max_connections, 12);

        let bad = ServerConfig::from_lookup(|key| (key == "CAFE_DUEL_BIND").then(|| "nowhere".to_string()));
        assert!(matches!(bad, Err(GameServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config, Arc::new(MemoryUserStore::new()));

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
        server.shutdown();
    }

    async fn next_server_message<S>(ws: &mut S) -> ServerMessage
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_create_join_and_push_over_websocket() {
        let store = Arc::new(
            MemoryUserStore::with_users([UserRecord::new("Host", 100), UserRecord::new("Guest", 100)]).await,
        );
        let server = Arc::new(GameServer::new(ServerConfig::default(), store));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        let create = ClientMessage::Create(CreateRequest {
            host: "Host".into(),
            game_type: GameType::RetroChess,
            stake: 10,
            table: String::new(),
            clock: None,
        });
        ws.send(Message::Text(create.to_json().unwrap())).await.unwrap();
        let session_id = match next_server_message(&mut ws).await {
            ServerMessage::Snapshot { snapshot } => {
                assert_eq!(snapshot.status, SessionStatus::Waiting);
                assert_eq!(snapshot.table, "default");
                snapshot.id
            }
            other => panic!("Wrong message type: {other:?}"),
        };

        let subscribe = ClientMessage::Subscribe { session_id };
        ws.send(Message::Text(subscribe.to_json().unwrap())).await.unwrap();
        assert!(matches!(next_server_message(&mut ws).await, ServerMessage::Subscribed { .. }));
        assert!(matches!(next_server_message(&mut ws).await, ServerMessage::Snapshot { .. }));

        let join = ClientMessage::Act {
            session_id,
            identity: "Guest".into(),
            action: SessionAction::Join,
        };
        ws.send(Message::Text(join.to_json().unwrap())).await.unwrap();

        let mut saw_push = false;
        let mut saw_ack = false;
        while !(saw_push && saw_ack) {
            match next_server_message(&mut ws).await {
                ServerMessage::Push { event } => {
                    assert_eq!(event.kind(), "game_joined");
                    saw_push = true;
                }
                ServerMessage::Ack(ack) => {
                    assert_eq!(ack.snapshot.status, SessionStatus::Active);
                    saw_ack = true;
                }
                other => panic!("Wrong message type: {other:?}"),
            }
        }

        let lookup = ClientMessage::ActiveSession { identity: " guest ".into() };
        ws.send(Message::Text(lookup.to_json().unwrap())).await.unwrap();
        match next_server_message(&mut ws).await {
            ServerMessage::Sessions { sessions } => {
                assert_eq!(sessions.iter().map(|s| s.id).collect::<Vec<_>>(), vec![session_id]);
            }
            other => panic!("Wrong message type: {other:?}"),
        }
        let listing = ClientMessage::ListOpen { table: None };
        ws.send(Message::Text(listing.to_json().unwrap())).await.unwrap();
        match next_server_message(&mut ws).await {
            ServerMessage::Sessions { sessions } => assert!(sessions.is_empty()),
            other => panic!("Wrong message type: {other:?}"),
        }

        let bogus = ClientMessage::Act {
            session_id,
            identity: "Stranger".into(),
            action: SessionAction::Resign,
        };
        ws.send(Message::Text(bogus.to_json().unwrap())).await.unwrap();
        match next_server_message(&mut ws).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::NotParticipant),
            other => panic!("Wrong message type: {other:?}"),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_rate_limit_reports_retry_hint() {
        let config = ServerConfig { requests_per_second: 1, request_burst: 1, ..Default::default() };
        let server = Arc::new(GameServer::new(config, Arc::new(MemoryUserStore::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let missing = ClientMessage::Snapshot { session_id: uuid::Uuid::nil() };
        for _ in 0..2 {
            ws.send(Message::Text(missing.to_json().unwrap())).await.unwrap();
        }

        match next_server_message(&mut ws).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::SessionNotFound),
            other => panic!("Wrong message type: {other:?}"),
        }
        match next_server_message(&mut ws).await {
            ServerMessage::Error(err) => {
                assert_eq!(err.code, ErrorCode::RateLimited);
                assert!(err.retry_hint_ms().is_some());
            }
            other => panic!("Wrong message type: {other:?}"),
        }

        server.shutdown();
    }
}
