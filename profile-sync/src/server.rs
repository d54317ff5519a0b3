//! Relay node: WebSocket server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Full peer ──┐                         ┌── binary sync ──► every other connection
//!             ├── Room (RoomId) ── ProfileDoc
//! Observer  ──┘                    │    └── change observer ──► text push ──► observers
//!                                  │
//!                           RoomRegistry (connection bookkeeping)
//! ```
//!
//! Per room, state moves `NoRoom → RoomActive → NoRoom` as connections come
//! and go. Only the connection bookkeeping is dropped when a room empties;
//! the yrs document and its single change observer stay, so a full peer that
//! reconnects finds its data and observers keep getting pushes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, ConnectionId, RoomChannel, RoomEvent, RoomRegistry};
use crate::document::{Document, ProfileDoc};
use crate::lock;
use crate::protocol::{
    ConnectionTarget, MessageType, PushMessage, Role, RoomId, SyncMessage, HEALTH_PATH,
};

/// Status of the `/health` answer; any non-upgrade HTTP answer means alive.
pub const HEALTH_STATUS: StatusCode = StatusCode::UPGRADE_REQUIRED;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `RELAY_BIND_ADDR`, `RELAY_MAX_PEERS_PER_ROOM`
    /// and `RELAY_BROADCAST_CAPACITY`. Unparseable numbers are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("RELAY_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(n) = env_usize("RELAY_MAX_PEERS_PER_ROOM") {
            config.max_peers_per_room = n;
        }
        if let Some(n) = env_usize("RELAY_BROADCAST_CAPACITY") {
            config.broadcast_capacity = n.max(1);
        }
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a number");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub observer_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub dropped_observer_updates: u64,
    pub active_rooms: usize,
    pub documents: usize,
    pub pushes_sent: u64,
}

/// Shared document state of one room.
struct RoomDocument {
    doc: ProfileDoc,
    /// Long-lived fan-out channel; room bookkeeping is rebuilt around it
    channel: Arc<RoomChannel>,
    /// The room's change observer, installed once
    observer: Mutex<Option<yrs::Subscription>>,
}

impl RoomDocument {
    fn new(capacity: usize) -> Self {
        Self {
            doc: ProfileDoc::new(),
            channel: Arc::new(RoomChannel::new(capacity)),
            observer: Mutex::new(None),
        }
    }

    /// Push text for the current value, if the room holds one.
    fn current_push(&self, room: &RoomId) -> Option<String> {
        let raw = self.doc.snapshot()?;
        let document = Document::parse(&raw).ok()?;
        PushMessage::update(room, document.into_value()).to_text().ok()
    }
}

struct RelayState {
    config: ServerConfig,
    documents: RwLock<HashMap<RoomId, Arc<RoomDocument>>>,
    /// Rooms that already carry a change observer
    observed: Mutex<HashSet<RoomId>>,
    rooms: RoomRegistry,
    stats: RwLock<ServerStats>,
    pushes_sent: Arc<AtomicU64>,
}

impl RelayState {
    /// Get or create the room's document and make sure it is observed.
    async fn room_document(&self, room: &RoomId) -> Arc<RoomDocument> {
        let document = {
            let mut documents = self.documents.write().await;
            documents
                .entry(room.clone())
                .or_insert_with(|| Arc::new(RoomDocument::new(self.config.broadcast_capacity)))
                .clone()
        };
        self.ensure_observer(room, &document);
        document
    }

    /// Install the room's change observer unless it already has one.
    fn ensure_observer(&self, room: &RoomId, document: &RoomDocument) -> bool {
        let mut observed = lock(&self.observed);
        if !observed.insert(room.clone()) {
            return false;
        }

        log::debug!("Installing change observer for room {room}");
        let room = room.clone();
        let channel = document.channel.clone();
        let pushes_sent = self.pushes_sent.clone();
        let last_pushed: Mutex<Option<String>> = Mutex::new(None);

        let subscription = document.doc.observe_snapshot(move |raw| {
            let document = match Document::parse(&raw) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("Room {room}: not pushing malformed snapshot: {e}");
                    return;
                }
            };
            let canonical = document.to_snapshot();
            {
                let mut last = lock(&last_pushed);
                if last.as_deref() == Some(canonical.as_str()) {
                    return;
                }
                *last = Some(canonical);
            }
            match PushMessage::update(&room, document.into_value()).to_text() {
                Ok(text) => {
                    let receivers = channel.send(RoomEvent::Push(Arc::new(text)));
                    pushes_sent.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Room {room}: pushed change to {receivers} receivers");
                }
                Err(e) => log::error!("Room {room}: failed to encode push: {e}"),
            }
        });

        *lock(&document.observer) = Some(subscription);
        true
    }
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Create a new relay with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(RelayState {
                config,
                documents: RwLock::new(HashMap::new()),
                observed: Mutex::new(HashSet::new()),
                rooms: RoomRegistry::new(),
                stats: RwLock::new(ServerStats::default()),
                pushes_sent: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.state.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single connection from handshake to cleanup.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<RelayState>,
    ) -> Result<(), BoxError> {
        let mut target: Option<ConnectionTarget> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let uri = req.uri();
            if uri.path() == HEALTH_PATH {
                // The handshake refuses to send a 2xx rejection
                return Err(plain_response(HEALTH_STATUS, "ok"));
            }
            match ConnectionTarget::parse(uri.path(), uri.query()) {
                Ok(t) => {
                    target = Some(t);
                    Ok(resp)
                }
                Err(e) => Err(plain_response(StatusCode::BAD_REQUEST, &e.to_string())),
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("Handshake from {addr} not upgraded: {e}");
                return Ok(());
            }
        };
        let Some(ConnectionTarget { room, role }) = target else {
            return Ok(());
        };

        let document = state.room_document(&room).await;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        let limit = state.config.max_peers_per_room;
        let Some((_group, events_rx)) =
            state.rooms.join(&room, &document.channel, conn_id, role, limit).await
        else {
            log::warn!("Room {room} is full, refusing {role} connection from {addr}");
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        };
        {
            let mut s = state.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            if role == Role::Observer {
                s.observer_connections += 1;
            }
        }
        log::info!("{role} connection {conn_id} from {addr} joined room {room}");

        let result = Self::pump_connection(
            &state, &document, &room, role, conn_id, ws_sender, ws_receiver, events_rx,
        )
        .await;

        // Cleanup: only bookkeeping goes, the document stays
        if state.rooms.leave(&room, &conn_id).await {
            log::info!("Room {room} emptied, connection bookkeeping dropped");
        }
        {
            let mut s = state.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            if role == Role::Observer {
                s.observer_connections = s.observer_connections.saturating_sub(1);
            }
            s.active_rooms = state.rooms.room_count().await;
        }
        log::info!("Connection {conn_id} left room {room}");

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump_connection(
        state: &RelayState,
        document: &RoomDocument,
        room: &RoomId,
        role: Role,
        conn_id: ConnectionId,
        mut ws_sender: WsSink,
        mut ws_receiver: WsSource,
        mut events_rx: broadcast::Receiver<RoomEvent>,
    ) -> Result<(), BoxError> {
        // Our state vector first, so full peers can send what we lack
        let step1 = SyncMessage::sync_step1(room, document.doc.state_vector()).encode()?;
        ws_sender.send(Message::Binary(step1.into())).await?;

        // Observers get the current value without waiting for a change
        if role == Role::Observer {
            if let Some(text) = document.current_push(room) {
                ws_sender.send(Message::Text(text.into())).await?;
            }
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Some(reply) =
                                Self::handle_frame(state, document, room, role, conn_id, &data).await
                            {
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("WebSocket error on {conn_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                event = events_rx.recv() => {
                    match event {
                        Ok(event) if event.is_for(&conn_id, role) => match event {
                            RoomEvent::Sync { frame, .. } => {
                                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                            }
                            RoomEvent::Push(text) => {
                                ws_sender.send(Message::Text(text.to_string().into())).await?;
                            }
                        },
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Process one binary frame. Returns an encoded reply, if any.
    async fn handle_frame(
        state: &RelayState,
        document: &RoomDocument,
        room: &RoomId,
        role: Role,
        conn_id: ConnectionId,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        {
            let mut s = state.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += data.len() as u64;
        }

        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode frame from {conn_id}: {e}");
                return None;
            }
        };
        if &msg.room != room {
            log::warn!("Connection {conn_id} sent a frame for {} on room {room}", msg.room);
            return None;
        }

        match msg.msg_type {
            MessageType::SyncStep1 => match document.doc.diff(&msg.payload) {
                Ok(diff) => SyncMessage::sync_step2(room, diff).encode().ok(),
                Err(e) => {
                    log::warn!("Bad state vector from {conn_id}: {e}");
                    None
                }
            },

            MessageType::SyncStep2 | MessageType::Update => {
                if role == Role::Observer {
                    log::debug!("Dropping update from observer {conn_id}");
                    state.stats.write().await.dropped_observer_updates += 1;
                    return None;
                }
                // Applying fires the change observer synchronously
                if let Err(e) = document.doc.apply_update(&msg.payload) {
                    log::warn!("Rejected update from {conn_id}: {e}");
                    return None;
                }
                match SyncMessage::update(room, msg.payload).encode() {
                    Ok(frame) => {
                        document.channel.send(RoomEvent::Sync {
                            origin: conn_id,
                            frame: Arc::new(frame),
                        });
                    }
                    Err(e) => log::error!("Failed to re-encode update: {e}"),
                }
                None
            }

            MessageType::Ping => SyncMessage::pong(room).encode().ok(),

            MessageType::Pong => None,
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.state.stats.read().await.clone();
        stats.documents = self.state.documents.read().await.len();
        stats.active_rooms = self.state.rooms.room_count().await;
        stats.pushes_sent = self.state.pushes_sent.load(Ordering::Relaxed);
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    /// Raw snapshot currently held for `room`.
    pub async fn snapshot(&self, room: &RoomId) -> Option<String> {
        let documents = self.state.documents.read().await;
        documents.get(room)?.doc.snapshot()
    }

    /// Fan-out statistics of a room with live connections.
    pub async fn room_stats(&self, room: &RoomId) -> Option<BroadcastStats> {
        let group = self.state.rooms.get(room).await?;
        Some(group.stats().await)
    }

    /// Number of rooms carrying a change observer.
    pub fn observed_rooms(&self) -> usize {
        lock(&self.state.observed).len()
    }
}

fn plain_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}
