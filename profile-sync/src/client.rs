//! Outbound connection to a relay node.
//!
//! A [`RelayLink`] owns one WebSocket for one (room, role) pair and a local
//! yrs replica of the room's document. It provides:
//! - The sync handshake (SyncStep1 out, SyncStep2 in)
//! - Incremental updates in both directions (writes only for full peers)
//! - Out-of-band pushes for observers
//! - A watch channel carrying the latest snapshot from either path
//!
//! Dropping a link closes its socket.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use crate::document::{Document, ProfileDoc};
use crate::error::RelayError;
use crate::protocol::{room_url, MessageType, PushMessage, Role, RoomId, SyncMessage};

/// Bound on a single socket write before the link is given up.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// One live connection to a relay room.
pub struct RelayLink {
    relay: String,
    room: RoomId,
    role: Role,
    doc: Arc<ProfileDoc>,
    snapshots: watch::Receiver<Option<String>>,
    synced: watch::Receiver<bool>,
    closed: watch::Receiver<bool>,
    pongs: watch::Receiver<u64>,
    outgoing_tx: mpsc::UnboundedSender<Message>,
    _observer: yrs::Subscription,
    reader: JoinHandle<()>,
}

impl RelayLink {
    /// Connect to `room` on `relay` and start the sync handshake.
    ///
    /// Returns once the WebSocket is up; content arrives asynchronously.
    pub async fn connect(relay: &str, room: &RoomId, role: Role) -> Result<Self, RelayError> {
        let url = room_url(relay, room, role);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| RelayError::connection(relay, e))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::debug!("Connected to {url}");

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match timeout(WRITE_TIMEOUT, ws_writer.send(msg)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
                if closing {
                    break;
                }
            }
        });

        let doc = Arc::new(ProfileDoc::new());
        let (snap_tx, snap_rx) = watch::channel(None::<String>);
        let snap_tx = Arc::new(snap_tx);
        let (synced_tx, synced_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (pong_tx, pong_rx) = watch::channel(0u64);

        let observer = {
            let snap_tx = snap_tx.clone();
            doc.observe_snapshot(move |raw| publish_snapshot(&snap_tx, canonical(raw)))
        };

        let step1 = SyncMessage::sync_step1(room, doc.state_vector()).encode()?;
        out_tx
            .send(Message::Binary(step1.into()))
            .map_err(|_| RelayError::connection(relay, "writer stopped"))?;

        // Reader task: process incoming frames
        let reader = {
            let doc = doc.clone();
            let room = room.clone();
            let out_tx = out_tx.clone();
            let relay = relay.to_string();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let msg = match SyncMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {relay}: {e}");
                                    continue;
                                }
                            };
                            match msg.msg_type {
                                MessageType::SyncStep1 => {
                                    // Only full peers have anything to offer
                                    if role == Role::Full {
                                        if let Ok(diff) = doc.diff(&msg.payload) {
                                            if let Ok(frame) = SyncMessage::sync_step2(&room, diff).encode() {
                                                let _ = out_tx.send(Message::Binary(frame.into()));
                                            }
                                        }
                                    }
                                }
                                MessageType::SyncStep2 => {
                                    if let Err(e) = doc.apply_update(&msg.payload) {
                                        log::warn!("Bad sync state from {relay}: {e}");
                                    }
                                    synced_tx.send_replace(true);
                                }
                                MessageType::Update => {
                                    if let Err(e) = doc.apply_update(&msg.payload) {
                                        log::warn!("Bad update from {relay}: {e}");
                                    }
                                }
                                MessageType::Ping => {
                                    if let Ok(frame) = SyncMessage::pong(&room).encode() {
                                        let _ = out_tx.send(Message::Binary(frame.into()));
                                    }
                                }
                                MessageType::Pong => {
                                    pong_tx.send_modify(|n| *n += 1);
                                }
                            }
                        }
                        Ok(Message::Text(text)) => match PushMessage::from_text(text.as_str()) {
                            Ok(PushMessage::Update { document, .. }) => {
                                log::trace!("Push for {room} from {relay}");
                                publish_snapshot(&snap_tx, document.to_string());
                            }
                            Err(e) => log::warn!("Discarding malformed push from {relay}: {e}"),
                        },
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            log::debug!("Link to {relay} failed: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
                closed_tx.send_replace(true);
                log::debug!("Link to {relay} for {room} closed");
            })
        };

        Ok(Self {
            relay: relay.to_string(),
            room: room.clone(),
            role,
            doc,
            snapshots: snap_rx,
            synced: synced_rx,
            closed: closed_rx,
            pongs: pong_rx,
            outgoing_tx: out_tx,
            _observer: observer,
            reader,
        })
    }

    /// Connect and wait for the first parseable document, all within `bound`.
    pub async fn open(
        relay: &str,
        room: &RoomId,
        role: Role,
        bound: Duration,
    ) -> Result<(Self, Document), RelayError> {
        timeout(bound, async {
            let link = Self::connect(relay, room, role).await?;
            let document = link.first_document().await?;
            Ok::<_, RelayError>((link, document))
        })
        .await
        .map_err(|_| RelayError::Timeout(bound))?
    }

    /// One-shot connect, sync, read, disconnect. `None` when the relay
    /// holds no value for the room.
    pub async fn fetch(relay: &str, room: &RoomId, bound: Duration) -> Result<Option<String>, RelayError> {
        timeout(bound, async {
            let link = Self::connect(relay, room, Role::Observer).await?;
            link.wait_synced().await?;
            Ok::<_, RelayError>(link.latest())
        })
        .await
        .map_err(|_| RelayError::Timeout(bound))?
    }

    async fn first_document(&self) -> Result<Document, RelayError> {
        let mut snapshots = self.snapshots.clone();
        let mut closed = self.closed.clone();
        tokio::select! {
            found = snapshots.wait_for(|s| s.as_deref().is_some_and(|raw| Document::parse(raw).is_ok())) => {
                let found = found.map_err(|_| RelayError::NotConnected)?;
                let raw = found.clone().unwrap_or_default();
                Ok(Document::parse(&raw)?)
            }
            _ = closed.wait_for(|c| *c) => Err(RelayError::connection(&self.relay, "closed before first document")),
        }
    }

    /// Wait until the relay's initial state has been applied, within `bound`.
    pub async fn synced(&self, bound: Duration) -> Result<(), RelayError> {
        timeout(bound, self.wait_synced())
            .await
            .map_err(|_| RelayError::Timeout(bound))?
    }

    async fn wait_synced(&self) -> Result<(), RelayError> {
        let mut synced = self.synced.clone();
        let mut closed = self.closed.clone();
        tokio::select! {
            r = synced.wait_for(|s| *s) => r.map(|_| ()).map_err(|_| RelayError::NotConnected),
            _ = closed.wait_for(|c| *c) => Err(RelayError::connection(&self.relay, "closed before sync")),
        }
    }

    /// Write a new snapshot locally and send the update to the relay.
    pub fn write(&self, document: &Document) -> Result<(), RelayError> {
        if self.role == Role::Observer {
            return Err(RelayError::ReadOnly);
        }
        if !self.is_open() {
            return Err(RelayError::NotConnected);
        }
        let update = self.doc.set_snapshot(&document.to_snapshot());
        let frame = SyncMessage::update(&self.room, update).encode()?;
        self.outgoing_tx
            .send(Message::Binary(frame.into()))
            .map_err(|_| RelayError::NotConnected)
    }

    /// Wait until the relay has processed every frame sent so far.
    pub async fn flush(&self, bound: Duration) -> Result<(), RelayError> {
        let mut pongs = self.pongs.clone();
        let seen = *pongs.borrow_and_update();
        let ping = SyncMessage::ping(&self.room).encode()?;
        self.outgoing_tx
            .send(Message::Binary(ping.into()))
            .map_err(|_| RelayError::NotConnected)?;
        let answered = timeout(bound, pongs.wait_for(|n| *n > seen))
            .await
            .map_err(|_| RelayError::Timeout(bound))?
            .map(|_| ())
            .map_err(|_| RelayError::NotConnected);
        answered
    }

    /// Latest known snapshot, canonicalized when it parses.
    pub fn latest(&self) -> Option<String> {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every new snapshot value.
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<String>> {
        self.snapshots.clone()
    }

    /// Receiver that turns true once the link has ended.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        // The writer flushes this and exits once the sender is gone
        let _ = self.outgoing_tx.send(Message::Close(None));
        self.reader.abort();
    }
}

fn publish_snapshot(tx: &watch::Sender<Option<String>>, raw: String) {
    tx.send_if_modified(|current| {
        if current.as_deref() == Some(raw.as_str()) {
            false
        } else {
            *current = Some(raw);
            true
        }
    });
}

/// Canonical form when the value parses, raw text otherwise.
fn canonical(raw: String) -> String {
    match Document::parse(&raw) {
        Ok(document) => document.to_snapshot(),
        Err(_) => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let port = closed_port().await;
        let room = RoomId::for_document("alice");
        let err = RelayLink::connect(&format!("ws://127.0.0.1:{port}"), &room, Role::Observer)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Connection { .. }));
        assert!(err.is_soft());
    }

    #[tokio::test]
    async fn test_fetch_refused_fails_fast() {
        let port = closed_port().await;
        let room = RoomId::for_document("alice");
        let start = std::time::Instant::now();
        let result = RelayLink::fetch(&format!("ws://127.0.0.1:{port}"), &room, Duration::from_secs(5)).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_canonical() {
        assert_eq!(canonical(r#"{ "b":1, "a":2 }"#.into()), r#"{"a":2,"b":1}"#);
        assert_eq!(canonical("{oops".into()), "{oops");
    }

    #[test]
    fn test_publish_snapshot_dedups() {
        let (tx, mut rx) = watch::channel(None::<String>);
        publish_snapshot(&tx, "1".into());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        publish_snapshot(&tx, "1".into());
        assert!(!rx.has_changed().unwrap());
    }
}
