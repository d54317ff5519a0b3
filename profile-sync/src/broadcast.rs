//! Per-room fan-out with role-tagged connection bookkeeping.
//!
//! Uses tokio broadcast channels for O(1) send to all connections of a room.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` events and filters what it forwards by its own role and id:
//!
//! - [`RoomEvent::Sync`] goes to every connection except its origin.
//! - [`RoomEvent::Push`] goes to observer connections only.
//!
//! The [`RoomChannel`] belongs to the room's document and outlives the
//! bookkeeping kept here, so a room that empties and fills again keeps
//! publishing through the same change observer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Role, RoomId};

/// Relay-side identity of one accepted connection.
pub type ConnectionId = Uuid;

/// An event fanned out to the connections of a room.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Pre-encoded binary sync frame from `origin`.
    Sync {
        origin: ConnectionId,
        frame: Arc<Vec<u8>>,
    },
    /// Pre-encoded out-of-band push text for observers.
    Push(Arc<String>),
}

impl RoomEvent {
    /// Whether a connection with `id` and `role` should forward this event.
    pub fn is_for(&self, id: &ConnectionId, role: Role) -> bool {
        match self {
            RoomEvent::Sync { origin, .. } => origin != id,
            RoomEvent::Push(_) => role == Role::Observer,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub active_connections: usize,
    pub observers: usize,
}

/// A room's long-lived event channel. Every send of the room goes through it.
pub struct RoomChannel {
    sender: broadcast::Sender<RoomEvent>,
    events_sent: AtomicU64,
}

impl RoomChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_sent: AtomicU64::new(0),
        }
    }

    /// Send an event to every receiver. Returns the number of receivers.
    pub fn send(&self, event: RoomEvent) -> usize {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }

    /// Events sent over the lifetime of the room.
    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }
}

/// Connection bookkeeping and fan-out for a single room.
pub struct BroadcastGroup {
    channel: Arc<RoomChannel>,
    connections: RwLock<HashMap<ConnectionId, Role>>,
}

impl BroadcastGroup {
    /// Wrap the room's long-lived event channel.
    pub fn new(channel: Arc<RoomChannel>) -> Self {
        Self {
            channel,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. Returns a receiver for its outgoing events.
    pub async fn join(&self, id: ConnectionId, role: Role) -> broadcast::Receiver<RoomEvent> {
        let mut connections = self.connections.write().await;
        connections.insert(id, role);
        self.channel.subscribe()
    }

    /// Remove a connection.
    pub async fn leave(&self, id: &ConnectionId) -> Option<Role> {
        self.connections.write().await.remove(id)
    }

    /// Send an event to every receiver. Returns the number of receivers.
    pub fn send(&self, event: RoomEvent) -> usize {
        self.channel.send(event)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let connections = self.connections.read().await;
        BroadcastStats {
            events_sent: self.channel.events_sent(),
            active_connections: connections.len(),
            observers: connections.values().filter(|r| **r == Role::Observer).count(),
        }
    }
}

/// Room registry: maps room ids to their live connection groups.
///
/// Entries exist only while a room has connections. Joining and leaving
/// hold the registry write lock, so the per-room limit and the removal of
/// an emptied room never race a concurrent join.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room` unless it already holds `limit` connections.
    ///
    /// Creates the room's group around `channel` when absent. Returns `None`
    /// when the room is full.
    pub async fn join(
        &self,
        room: &RoomId,
        channel: &Arc<RoomChannel>,
        id: ConnectionId,
        role: Role,
        limit: usize,
    ) -> Option<(Arc<BroadcastGroup>, broadcast::Receiver<RoomEvent>)> {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.connection_count().await >= limit {
                return None;
            }
        } else if limit == 0 {
            return None;
        }
        let group = rooms
            .entry(room.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(channel.clone())))
            .clone();
        let rx = group.join(id, role).await;
        Some((group, rx))
    }

    /// Remove a connection. Returns true when the room emptied and its
    /// bookkeeping was dropped.
    pub async fn leave(&self, room: &RoomId, id: &ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room) else {
            return false;
        };
        group.leave(id).await;
        if group.connection_count().await == 0 {
            rooms.remove(room);
            return true;
        }
        false
    }

    pub async fn get(&self, room: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Arc<RoomChannel> {
        Arc::new(RoomChannel::new(16))
    }

    #[tokio::test]
    async fn test_join_leave() {
        let group = BroadcastGroup::new(channel());
        let id = Uuid::new_v4();

        let _rx = group.join(id, Role::Observer).await;
        let stats = group.stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.observers, 1);

        assert_eq!(group.leave(&id).await, Some(Role::Observer));
        assert_eq!(group.connection_count().await, 0);
        assert_eq!(group.leave(&id).await, None);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_receiver() {
        let group = BroadcastGroup::new(channel());
        let mut rx1 = group.join(Uuid::new_v4(), Role::Full).await;
        let mut rx2 = group.join(Uuid::new_v4(), Role::Observer).await;

        let count = group.send(RoomEvent::Push(Arc::new("hi".into())));
        assert_eq!(count, 2);

        assert!(matches!(rx1.recv().await.unwrap(), RoomEvent::Push(_)));
        assert!(matches!(rx2.recv().await.unwrap(), RoomEvent::Push(_)));
        assert_eq!(group.stats().await.events_sent, 1);
    }

    #[tokio::test]
    async fn test_channel_sends_show_in_group_stats() {
        let tx = channel();
        let group = BroadcastGroup::new(tx.clone());
        let _rx = group.join(Uuid::new_v4(), Role::Observer).await;

        tx.send(RoomEvent::Push(Arc::new("a".into())));
        tx.send(RoomEvent::Sync {
            origin: Uuid::new_v4(),
            frame: Arc::new(vec![1]),
        });
        assert_eq!(tx.events_sent(), 2);
        assert_eq!(group.stats().await.events_sent, 2);
    }

    #[test]
    fn test_event_filtering() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let sync = RoomEvent::Sync {
            origin: me,
            frame: Arc::new(vec![1]),
        };
        assert!(!sync.is_for(&me, Role::Full));
        assert!(sync.is_for(&other, Role::Full));
        assert!(sync.is_for(&other, Role::Observer));

        let push = RoomEvent::Push(Arc::new("{}".into()));
        assert!(push.is_for(&me, Role::Observer));
        assert!(!push.is_for(&me, Role::Full));
    }

    #[tokio::test]
    async fn test_registry_reuses_group() {
        let registry = RoomRegistry::new();
        let room = RoomId::for_document("alice");
        let tx = channel();

        let (a, _rx_a) = registry.join(&room, &tx, Uuid::new_v4(), Role::Full, 10).await.unwrap();
        let (b, _rx_b) = registry.join(&room, &tx, Uuid::new_v4(), Role::Observer, 10).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(a.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_registry_cleanup() {
        let registry = RoomRegistry::new();
        let room = RoomId::for_document("alice");
        let tx = channel();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let _rx1 = registry.join(&room, &tx, first, Role::Full, 10).await.unwrap();
        let _rx2 = registry.join(&room, &tx, second, Role::Full, 10).await.unwrap();

        assert!(!registry.leave(&room, &first).await);
        assert!(registry.get(&room).await.is_some());
        assert!(registry.leave(&room, &second).await);
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.get(&room).await.is_none());
        assert!(!registry.leave(&room, &second).await);
    }

    #[tokio::test]
    async fn test_registry_enforces_room_limit() {
        let registry = RoomRegistry::new();
        let room = RoomId::for_document("alice");
        let tx = channel();

        let first = Uuid::new_v4();
        assert!(registry.join(&room, &tx, first, Role::Full, 2).await.is_some());
        assert!(registry.join(&room, &tx, Uuid::new_v4(), Role::Observer, 2).await.is_some());
        assert!(registry.join(&room, &tx, Uuid::new_v4(), Role::Observer, 2).await.is_none());
        assert_eq!(registry.get(&room).await.unwrap().connection_count().await, 2);

        registry.leave(&room, &first).await;
        assert!(registry.join(&room, &tx, Uuid::new_v4(), Role::Full, 2).await.is_some());
        assert!(registry.join(&RoomId::for_document("bob"), &tx, Uuid::new_v4(), Role::Full, 0).await.is_none());
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_respect_limit() {
        let registry = Arc::new(RoomRegistry::new());
        let room = RoomId::for_document("alice");
        let tx = channel();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let room = room.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                registry
                    .join(&room, &tx, Uuid::new_v4(), Role::Observer, 4)
                    .await
                    .map(|(_, rx)| rx)
            });
        }
        let mut admitted = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(rx) = joined.unwrap() {
                admitted.push(rx);
            }
        }
        assert_eq!(admitted.len(), 4);
        assert_eq!(registry.get(&room).await.unwrap().connection_count().await, 4);
    }

    #[tokio::test]
    async fn test_recreated_group_shares_channel() {
        let registry = RoomRegistry::new();
        let room = RoomId::for_document("alice");
        let tx = channel();

        let id = Uuid::new_v4();
        let (first, _rx) = registry.join(&room, &tx, id, Role::Full, 10).await.unwrap();
        assert!(registry.leave(&room, &id).await);
        drop(first);

        let (_second, mut rx) = registry.join(&room, &tx, Uuid::new_v4(), Role::Observer, 10).await.unwrap();
        tx.send(RoomEvent::Push(Arc::new("later".into())));
        match rx.recv().await.unwrap() {
            RoomEvent::Push(text) => assert_eq!(text.as_str(), "later"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
