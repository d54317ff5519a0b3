//! In-memory live copy of one profile, backed by a relay link.
//!
//! Lifecycle:
//! ```text
//! Connecting ──attach(link)──► Syncing ──first value──► Ready
//!      │                          │                       │
//!      └──────────────────────────┴──────── close() ──────┴──► Closed
//! ```
//!
//! Two paths feed changes in: the link's snapshot watch (CRDT sync and
//! observer pushes) and a polling loop doing one-shot fetches while anyone
//! listens. Both go through [`Replica::apply_snapshot`], which holds the
//! notification lock for the whole cycle: compare, store, cache, notify.
//! That lock is what makes delivery exactly-once per distinct value and
//! keeps teardown from cutting a cycle in half.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::cache::DiskCache;
use crate::client::RelayLink;
use crate::document::Document;
use crate::error::{ListenerError, RelayError};
use crate::lock;
use crate::protocol::{Role, RoomId};

/// Change-notification callback registered by a subscriber.
pub type Listener = Arc<dyn Fn(&Document) -> Result<(), ListenerError> + Send + Sync>;

/// Identifies one registered listener within its replica.
pub type ListenerId = u64;

/// Resolves to the first known snapshot, or `None` after the grace window.
pub type ReadyFuture = BoxFuture<'static, Option<Document>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// No relay bound yet
    Connecting,
    /// Link attached, no confirmed value from it yet
    Syncing,
    /// Holding a value confirmed by the bound relay
    Ready,
    Closed,
}

/// Polling parameters handed over at attach time.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub fetch_timeout: Duration,
}

pub struct Replica {
    room: RoomId,
    cache: DiskCache,
    state: watch::Sender<ReplicaState>,
    document: watch::Sender<Option<Document>>,
    /// Canonical form of the last handled value; locked for a whole cycle
    last_snapshot: tokio::sync::Mutex<Option<String>>,
    listeners: Mutex<BTreeMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
    relay: Mutex<Option<String>>,
    link: tokio::sync::Mutex<Option<RelayLink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    changes: AtomicU64,
    primary: AtomicBool,
}

impl Replica {
    pub fn new(room: RoomId, cache: DiskCache) -> Arc<Self> {
        Arc::new(Self {
            room,
            cache,
            state: watch::channel(ReplicaState::Connecting).0,
            document: watch::channel(None).0,
            last_snapshot: tokio::sync::Mutex::new(None),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
            relay: Mutex::new(None),
            link: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            idle_timer: Mutex::new(None),
            changes: AtomicU64::new(0),
            primary: AtomicBool::new(false),
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.borrow()
    }

    pub fn document(&self) -> Option<Document> {
        self.document.borrow().clone()
    }

    /// Relay this replica is bound to, once attached.
    pub fn relay(&self) -> Option<String> {
        lock(&self.relay).clone()
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.relay).is_some()
    }

    /// Whether the primary change path is still following a live link.
    pub fn has_primary_link(&self) -> bool {
        self.primary.load(Ordering::Relaxed)
    }

    /// Number of distinct values handled so far.
    pub fn changes_seen(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    /// Start from a cached value without notifying anyone.
    pub async fn seed(&self, document: Document) {
        let mut last = self.last_snapshot.lock().await;
        if last.is_none() {
            *last = Some(document.to_snapshot());
            self.document.send_replace(Some(document));
        }
    }

    /// Bind to a relay through `link` and start the primary and polling
    /// change paths. Returns `false` if the replica is already closed or bound.
    pub(crate) async fn attach(self: &Arc<Self>, link: RelayLink, poll: PollSettings) -> bool {
        let mut slot = self.link.lock().await;
        if self.state() == ReplicaState::Closed || slot.is_some() {
            return false;
        }

        let relay = link.relay().to_string();
        let snapshots = link.subscribe_snapshots();
        let closed = link.subscribe_closed();
        *lock(&self.relay) = Some(relay.clone());
        *slot = Some(link);
        drop(slot);
        self.state.send_replace(ReplicaState::Syncing);
        self.primary.store(true, Ordering::Relaxed);

        let pump = tokio::spawn(pump_changes(Arc::downgrade(self), snapshots, closed));
        let poller = tokio::spawn(poll_changes(
            Arc::downgrade(self),
            relay.clone(),
            self.room.clone(),
            poll,
        ));
        lock(&self.tasks).extend([pump, poller]);

        log::info!("Replica {} bound to {relay}", self.room);
        true
    }

    /// Handle a candidate value from any path. Returns `true` when it was a
    /// new value and listeners were notified.
    pub async fn apply_snapshot(&self, raw: &str) -> bool {
        let document = match Document::parse(raw) {
            Ok(document) => document,
            Err(e) => {
                log::warn!("Replica {}: keeping last value, bad payload: {e}", self.room);
                return false;
            }
        };
        let canonical = document.to_snapshot();

        let mut last = self.last_snapshot.lock().await;
        let state = self.state();
        if state == ReplicaState::Closed {
            return false;
        }
        let relay = self.relay();
        if relay.is_some() && state != ReplicaState::Ready {
            self.state.send_replace(ReplicaState::Ready);
        }
        if last.as_deref() == Some(canonical.as_str()) {
            return false;
        }

        *last = Some(canonical);
        self.document.send_replace(Some(document.clone()));
        self.changes.fetch_add(1, Ordering::Relaxed);
        self.cache.put(&self.room, &document, relay.as_deref()).await;
        self.notify(&document);
        true
    }

    /// Call every listener; failures and panics stay inside their own call.
    fn notify(&self, document: &Document) {
        let listeners: Vec<(ListenerId, Listener)> = lock(&self.listeners)
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(document))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Listener {id} on {} failed: {e}", self.room),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    log::error!("Listener {id} on {} panicked: {reason}", self.room);
                }
            }
        }
    }

    /// Register a listener. Cancels a pending idle teardown.
    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).insert(id, listener);
        self.cancel_idle_timer();
        id
    }

    /// Unregister a listener. Returns the remaining count if it was present.
    pub fn remove_listener(&self, id: ListenerId) -> Option<usize> {
        let mut listeners = lock(&self.listeners);
        listeners.remove(&id).map(|_| listeners.len())
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub(crate) fn set_idle_timer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.idle_timer).replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_idle_timer(&self) {
        if let Some(handle) = lock(&self.idle_timer).take() {
            handle.abort();
        }
    }

    /// Detach the idle timer without aborting it; used by the timer itself.
    pub(crate) fn take_idle_timer(&self) -> Option<JoinHandle<()>> {
        lock(&self.idle_timer).take()
    }

    /// Write a new value through the bound link, then handle it locally.
    pub async fn write(&self, document: &Document) -> Result<(), RelayError> {
        {
            let link = self.link.lock().await;
            let link = link.as_ref().ok_or(RelayError::NotConnected)?;
            link.write(document)?;
        }
        self.apply_snapshot(&document.to_snapshot()).await;
        Ok(())
    }

    /// Wait until the relay has applied everything written so far.
    pub async fn flush(&self, bound: Duration) -> Result<(), RelayError> {
        let link = self.link.lock().await;
        link.as_ref().ok_or(RelayError::NotConnected)?.flush(bound).await
    }

    /// Role of the bound link.
    pub async fn role(&self) -> Option<Role> {
        self.link.lock().await.as_ref().map(RelayLink::role)
    }

    /// Future resolving with the first known value, or `None` once `grace`
    /// passes or the replica closes.
    pub fn ready(&self, grace: Duration) -> ReadyFuture {
        let mut documents = self.document.subscribe();
        let mut states = self.state.subscribe();
        async move {
            let found = async move {
                documents
                    .wait_for(|d| d.is_some())
                    .await
                    .ok()
                    .and_then(|d| d.clone())
            };
            let closed = async move {
                let _ = states.wait_for(|s| *s == ReplicaState::Closed).await;
            };
            let raced = async move {
                tokio::select! {
                    document = found => document,
                    _ = closed => None,
                }
            };
            timeout(grace, raced).await.ok().flatten()
        }
        .boxed()
    }

    /// Tear down: close the link, stop both change paths, drop timers.
    /// Waits for an in-flight notification cycle. Idempotent.
    pub async fn close(&self) {
        let _cycle = self.last_snapshot.lock().await;
        if self.state() == ReplicaState::Closed {
            return;
        }
        self.state.send_replace(ReplicaState::Closed);
        self.primary.store(false, Ordering::Relaxed);

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.cancel_idle_timer();
        if let Some(link) = self.link.lock().await.take() {
            drop(link);
        }
        log::info!("Replica {} closed", self.room);
    }
}

/// Primary path: follow the link's snapshot watch until the link ends.
async fn pump_changes(
    replica: Weak<Replica>,
    mut snapshots: watch::Receiver<Option<String>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let current = snapshots.borrow_and_update().clone();
        if let Some(raw) = current {
            let Some(replica) = replica.upgrade() else {
                return;
            };
            replica.apply_snapshot(&raw).await;
        }
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = closed.wait_for(|ended| *ended) => break,
        }
    }
    let Some(replica) = replica.upgrade() else {
        return;
    };
    // A value that landed just before the link ended
    let last = snapshots.borrow().clone();
    if let Some(raw) = last {
        replica.apply_snapshot(&raw).await;
    }
    replica.primary.store(false, Ordering::Relaxed);
    log::warn!("Replica {}: primary link ended, polling only", replica.room);
}

/// Secondary path: one-shot fetches while anyone listens.
async fn poll_changes(replica: Weak<Replica>, relay: String, room: RoomId, poll: PollSettings) {
    let mut ticker = interval(poll.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(replica) = replica.upgrade() else {
            break;
        };
        if replica.listener_count() == 0 {
            continue;
        }
        match RelayLink::fetch(&relay, &room, poll.fetch_timeout).await {
            Ok(Some(raw)) => {
                if replica.apply_snapshot(&raw).await {
                    log::debug!("Replica {room}: poll caught a change the primary path missed");
                }
            }
            Ok(None) => {}
            Err(e) => log::debug!("Replica {room}: poll of {relay} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn replica() -> (tempfile::TempDir, Arc<Replica>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        (dir, Replica::new(RoomId::for_document("alice"), cache))
    }

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let listener: Listener = Arc::new(move |_doc: &Document| -> Result<(), ListenerError> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, listener)
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (_dir, replica) = replica();
        assert_eq!(replica.state(), ReplicaState::Connecting);
        assert!(replica.document().is_none());
        assert!(!replica.is_bound());
        assert_eq!(replica.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_notifies_once_per_distinct_value() {
        let (_dir, replica) = replica();
        let (count, listener) = counter();
        replica.add_listener(listener);

        assert!(replica.apply_snapshot(r#"{"v":1}"#).await);
        assert!(!replica.apply_snapshot(r#"{ "v": 1 }"#).await);
        assert!(replica.apply_snapshot(r#"{"v":2}"#).await);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(replica.changes_seen(), 2);
        assert_eq!(replica.document(), Some(Document::new(json!({"v": 2}))));
    }

    #[tokio::test]
    async fn test_bad_payload_keeps_last_value() {
        let (_dir, replica) = replica();
        replica.apply_snapshot(r#"{"v":1}"#).await;
        assert!(!replica.apply_snapshot("{garbage").await);
        assert_eq!(replica.document(), Some(Document::new(json!({"v": 1}))));
    }

    #[tokio::test]
    async fn test_failing_listeners_are_isolated() {
        let (_dir, replica) = replica();
        replica.add_listener(Arc::new(|_doc: &Document| -> Result<(), ListenerError> {
            Err("nope".into())
        }));
        replica.add_listener(Arc::new(|_doc: &Document| -> Result<(), ListenerError> {
            panic!("listener blew up")
        }));
        let (count, listener) = counter();
        replica.add_listener(listener);

        assert!(replica.apply_snapshot(r#"{"v":1}"#).await);
        assert!(replica.apply_snapshot(r#"{"v":2}"#).await);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_listener_leaves_others() {
        let (_dir, replica) = replica();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let a_id = replica.add_listener(a);
        replica.add_listener(b);

        assert_eq!(replica.remove_listener(a_id), Some(1));
        assert_eq!(replica.remove_listener(a_id), None);
        replica.apply_snapshot("1").await;

        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_change_is_cached_with_provenance() {
        let (dir, replica) = replica();
        *lock(&replica.relay) = Some("ws://relay-a".into());
        replica.apply_snapshot(r#"{"v":3}"#).await;

        let entry = DiskCache::new(dir.path()).get(replica.room()).await.unwrap();
        assert_eq!(entry.document, Document::new(json!({"v": 3})));
        assert_eq!(entry.source_relay.as_deref(), Some("ws://relay-a"));
        assert_eq!(replica.state(), ReplicaState::Ready);
    }

    #[tokio::test]
    async fn test_seed_does_not_notify() {
        let (_dir, replica) = replica();
        let (count, listener) = counter();
        replica.add_listener(listener);

        replica.seed(Document::new(json!({"v": 1}))).await;
        assert!(!replica.apply_snapshot(r#"{"v":1}"#).await);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(replica.document().is_some());
    }

    #[tokio::test]
    async fn test_ready_resolves_with_first_value() {
        let (_dir, replica) = replica();
        let ready = replica.ready(Duration::from_secs(2));
        let r = replica.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            r.apply_snapshot(r#"{"v":9}"#).await;
        });
        assert_eq!(ready.await, Some(Document::new(json!({"v": 9}))));
    }

    #[tokio::test]
    async fn test_ready_times_out_absent() {
        let (_dir, replica) = replica();
        let start = std::time::Instant::now();
        assert_eq!(replica.ready(Duration::from_millis(100)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (_dir, replica) = replica();
        let ready = replica.ready(Duration::from_secs(5));
        replica.close().await;
        replica.close().await;

        assert_eq!(replica.state(), ReplicaState::Closed);
        assert!(!replica.apply_snapshot("1").await);
        assert_eq!(ready.await, None);
    }

    #[tokio::test]
    async fn test_write_without_link() {
        let (_dir, replica) = replica();
        let err = replica.write(&Document::new(json!({}))).await.unwrap_err();
        assert!(matches!(err, RelayError::NotConnected));
    }
}
