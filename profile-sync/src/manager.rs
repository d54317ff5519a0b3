//! Subscription manager: the client-side entry point.
//!
//! Owns every [`Replica`] in the process (at most one per room), resolves
//! document reads through replica, cache and network race, and ties
//! listener registration to replica lifetime through idle teardown.
//!
//! Read resolution, first hit wins:
//! ```text
//! live replica ─► fresh cache ─► preferred relay ─► parallel race ─► stale cache ─► None
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinSet;

use crate::cache::DiskCache;
use crate::client::RelayLink;
use crate::document::Document;
use crate::error::{ListenerError, RelayError};
use crate::lock;
use crate::probe::HealthProber;
use crate::protocol::{relay_ws_url, Role, RoomId};
use crate::replica::{Listener, ListenerId, PollSettings, ReadyFuture, Replica, ReplicaState};

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding one cache file per room
    pub cache_dir: PathBuf,
    /// Cache entries younger than this are served without touching the network
    pub fresh_ttl: Duration,
    /// Replica teardown delay after its last listener leaves
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    /// Bound on one polling fetch
    pub poll_timeout: Duration,
    /// Bound on the cached source relay fast path
    pub preferred_timeout: Duration,
    /// Bound on each parallel race leg
    pub race_timeout: Duration,
    /// How long a ready future waits for a first value
    pub ready_grace: Duration,
    pub probe_timeout: Duration,
    /// Role replicas connect with
    pub role: Role,
    /// Prune cache entries older than this at start; `None` keeps everything
    pub cache_prune_after: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("profile-sync-cache"),
            fresh_ttl: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(5),
            preferred_timeout: Duration::from_secs(5),
            race_timeout: Duration::from_secs(10),
            ready_grace: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(4),
            role: Role::Observer,
            cache_prune_after: None,
        }
    }
}

impl ManagerConfig {
    /// Short timings for tests against local relays.
    pub fn for_testing(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            idle_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(200),
            poll_timeout: Duration::from_secs(1),
            preferred_timeout: Duration::from_secs(1),
            race_timeout: Duration::from_secs(2),
            ready_grace: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.poll_interval,
            fetch_timeout: self.poll_timeout,
        }
    }
}

/// Room to replica map. At most one replica per room.
#[derive(Default)]
pub struct ReplicaRegistry {
    replicas: HashMap<RoomId, Arc<Replica>>,
}

impl ReplicaRegistry {
    pub fn get(&self, room: &RoomId) -> Option<Arc<Replica>> {
        self.replicas.get(room).cloned()
    }

    /// Existing live replica for `room`, or a new one from `create`.
    /// The flag is `true` when the replica was created.
    pub fn get_or_create(
        &mut self,
        room: &RoomId,
        create: impl FnOnce() -> Arc<Replica>,
    ) -> (Arc<Replica>, bool) {
        if let Some(existing) = self.replicas.get(room) {
            if existing.state() != ReplicaState::Closed {
                return (existing.clone(), false);
            }
        }
        let replica = create();
        self.replicas.insert(room.clone(), replica.clone());
        (replica, true)
    }

    /// Whether `replica` is the one registered for its room.
    pub fn is_current(&self, replica: &Arc<Replica>) -> bool {
        self.replicas
            .get(replica.room())
            .is_some_and(|r| Arc::ptr_eq(r, replica))
    }

    /// Remove `replica` if it is still the registered one.
    pub fn remove(&mut self, replica: &Arc<Replica>) -> bool {
        if self.is_current(replica) {
            self.replicas.remove(replica.room());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    fn drain(&mut self) -> Vec<Arc<Replica>> {
        self.replicas.drain().map(|(_, r)| r).collect()
    }
}

struct ManagerInner {
    config: ManagerConfig,
    cache: DiskCache,
    prober: HealthProber,
    registry: Mutex<ReplicaRegistry>,
    /// Runtime for idle timers armed from outside any runtime
    runtime: Mutex<Option<Handle>>,
}

/// Process-wide replica owner. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let cache = DiskCache::new(config.cache_dir.clone());
        if let Some(max_age) = config.cache_prune_after {
            match Handle::try_current() {
                Ok(handle) => {
                    let cache = cache.clone();
                    handle.spawn(async move {
                        cache.prune_older_than(max_age).await;
                    });
                }
                Err(_) => log::warn!("No async runtime; skipping cache prune"),
            }
        }

        log::info!("Subscription manager using cache at {}", config.cache_dir.display());
        Self {
            inner: Arc::new(ManagerInner {
                prober: HealthProber::new(config.probe_timeout),
                cache,
                config,
                registry: Mutex::new(ReplicaRegistry::default()),
                runtime: Mutex::new(Handle::try_current().ok()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &DiskCache {
        &self.inner.cache
    }

    /// Best available value for `doc_id`, or `None` when no source has one.
    pub async fn get_document(&self, doc_id: &str, candidates: &[String]) -> Option<Document> {
        let inner = &self.inner;
        let room = RoomId::for_document(doc_id);

        if let Some(document) = inner.registered(&room).and_then(|r| r.document()) {
            log::trace!("{room}: served from live replica");
            return Some(document);
        }

        let cached = inner.cache.get(&room).await;
        if let Some(entry) = &cached {
            if entry.is_fresh(inner.config.fresh_ttl) {
                log::debug!("{room}: served from fresh cache ({:?} old)", entry.age());
                if let Some(source) = &entry.source_relay {
                    inner.background_replica(&room, source, entry.document.clone());
                }
                return Some(entry.document.clone());
            }
        }

        let preferred = cached.as_ref().and_then(|e| e.source_relay.as_deref());
        if let Some((link, document)) = inner.locate(&room, preferred, candidates).await {
            inner.install(&room, link, &document).await;
            return Some(document);
        }

        match cached {
            Some(entry) => {
                log::info!("{room}: all relays failed, serving stale cache ({:?} old)", entry.age());
                Some(entry.document)
            }
            None => {
                log::warn!("{room}: no relay, replica or cache entry has a value");
                None
            }
        }
    }

    /// Register `on_change` for `doc_id`. The returned future resolves with
    /// the first known value, or `None` after the ready grace window.
    pub async fn subscribe<F>(
        &self,
        doc_id: &str,
        candidates: &[String],
        on_change: F,
    ) -> (Subscription, ReadyFuture)
    where
        F: Fn(&Document) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let room = RoomId::for_document(doc_id);
        let listener: Listener = Arc::new(on_change);
        inner.remember_runtime();

        let (replica, created, listener_id) = {
            let mut registry = lock(&inner.registry);
            let (replica, created) =
                registry.get_or_create(&room, || Replica::new(room.clone(), inner.cache.clone()));
            let id = replica.add_listener(listener);
            (replica, created, id)
        };

        if created {
            let cached = inner.cache.get(&room).await;
            let preferred = cached.as_ref().and_then(|e| e.source_relay.clone());
            if let Some(entry) = cached.filter(|e| e.is_fresh(inner.config.fresh_ttl)) {
                replica.seed(entry.document).await;
            }
            log::info!("{room}: new replica, binding among {} candidates", candidates.len());
            tokio::spawn(inner.clone().bind(replica.clone(), preferred, candidates.to_vec()));
        } else if let Some(relay) = replica.relay() {
            log::debug!("{room}: reusing replica bound to {relay}");
        }

        let ready = replica.ready(inner.config.ready_grace);
        let subscription = Subscription {
            manager: Arc::downgrade(inner),
            replica: Arc::downgrade(&replica),
            listener: listener_id,
            active: true,
        };
        (subscription, ready)
    }

    /// Write `document` for `doc_id` to `relay`.
    ///
    /// Goes through the live replica when it is bound to that relay with the
    /// full role, otherwise through a short-lived full link.
    pub async fn publish(&self, doc_id: &str, relay: &str, document: &Document) -> Result<(), RelayError> {
        let inner = &self.inner;
        let room = RoomId::for_document(doc_id);
        let bound = inner.config.preferred_timeout;

        if let Some(replica) = inner.registered(&room) {
            let same_relay = replica.relay().is_some_and(|r| relay_ws_url(&r) == relay_ws_url(relay));
            if same_relay && replica.role().await == Some(Role::Full) {
                replica.write(document).await?;
                return replica.flush(bound).await;
            }
        }

        let link = tokio::time::timeout(bound, RelayLink::connect(relay, &room, Role::Full))
            .await
            .map_err(|_| RelayError::Timeout(bound))??;
        link.synced(bound).await?;
        link.write(document)?;
        link.flush(bound).await?;
        drop(link);

        inner.cache.put(&room, document, Some(relay)).await;
        log::info!("{room}: published to {relay}");
        Ok(())
    }

    /// Number of live replicas.
    pub fn active_replicas(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    /// The replica currently registered for `doc_id`.
    pub fn replica(&self, doc_id: &str) -> Option<Arc<Replica>> {
        self.inner.registered(&RoomId::for_document(doc_id))
    }

    /// Close every replica.
    pub async fn shutdown(&self) {
        let replicas = lock(&self.inner.registry).drain();
        for replica in replicas {
            replica.close().await;
        }
    }
}

impl ManagerInner {
    fn registered(&self, room: &RoomId) -> Option<Arc<Replica>> {
        lock(&self.registry).get(room)
    }

    /// Start a replica on `relay` for a cache hit, without waiting for it.
    fn background_replica(self: &Arc<Self>, room: &RoomId, relay: &str, document: Document) {
        let (replica, created) =
            lock(&self.registry).get_or_create(room, || Replica::new(room.clone(), self.cache.clone()));
        if !created {
            return;
        }
        log::debug!("{room}: starting background replica on {relay}");
        self.arm_idle(&replica);

        let inner = self.clone();
        let relay = relay.to_string();
        tokio::spawn(async move {
            replica.seed(document).await;
            inner.bind(replica, Some(relay), Vec::new()).await;
        });
    }

    /// Find a relay holding the room and return its link with the first value.
    async fn locate(
        &self,
        room: &RoomId,
        preferred: Option<&str>,
        candidates: &[String],
    ) -> Option<(RelayLink, Document)> {
        let role = self.config.role;

        if let Some(relay) = preferred {
            match RelayLink::open(relay, room, role, self.config.preferred_timeout).await {
                Ok(found) => {
                    log::debug!("{room}: found on preferred relay {relay}");
                    return Some(found);
                }
                Err(e) => log::info!("{room}: preferred relay {relay} failed: {e}"),
            }
        }

        let mut legs = JoinSet::new();
        for relay in dedup_relays(candidates) {
            let room = room.clone();
            let prober = self.prober.clone();
            let bound = self.config.race_timeout;
            legs.spawn(async move {
                let started = Instant::now();
                if !prober.probe(&relay).await {
                    return Err(RelayError::Unreachable(relay));
                }
                RelayLink::open(&relay, &room, role, bound.saturating_sub(started.elapsed())).await
            });
        }

        while let Some(joined) = legs.join_next().await {
            match joined {
                Ok(Ok(found)) => {
                    log::debug!("{room}: race won by {}", found.0.relay());
                    // Losers' links are dropped with their tasks
                    legs.abort_all();
                    return Some(found);
                }
                Ok(Err(e)) => log::debug!("{room}: race leg failed: {e}"),
                Err(e) => log::warn!("{room}: race leg aborted: {e}"),
            }
        }
        None
    }

    /// Promote a located link to the room's replica.
    async fn install(self: &Arc<Self>, room: &RoomId, link: RelayLink, document: &Document) {
        let (replica, created) =
            lock(&self.registry).get_or_create(room, || Replica::new(room.clone(), self.cache.clone()));
        if replica.is_bound() {
            log::debug!("{room}: already bound, discarding {}", link.relay());
            return;
        }
        if created {
            self.arm_idle(&replica);
        }
        if replica.attach(link, self.config.poll_settings()).await {
            replica.apply_snapshot(&document.to_snapshot()).await;
        }
    }

    /// Bind a pending replica; on failure drop it from the registry.
    async fn bind(self: Arc<Self>, replica: Arc<Replica>, preferred: Option<String>, candidates: Vec<String>) {
        let room = replica.room().clone();
        match self.locate(&room, preferred.as_deref(), &candidates).await {
            Some((link, document)) => {
                if replica.attach(link, self.config.poll_settings()).await {
                    replica.apply_snapshot(&document.to_snapshot()).await;
                }
            }
            None => {
                log::warn!("{room}: no relay could be bound, dropping replica");
                lock(&self.registry).remove(&replica);
                replica.close().await;
            }
        }
    }

    fn remember_runtime(&self) {
        let mut runtime = lock(&self.runtime);
        if runtime.is_none() {
            *runtime = Handle::try_current().ok();
        }
    }

    /// (Re)start the idle teardown countdown for `replica`.
    ///
    /// Runs on the current runtime, or on the one the manager last saw when
    /// the last listener is released from a plain thread.
    fn arm_idle(self: &Arc<Self>, replica: &Arc<Replica>) {
        let current = Handle::try_current().ok();
        let Some(handle) = current.or_else(|| lock(&self.runtime).clone()) else {
            log::warn!("{}: no async runtime, idle teardown not armed", replica.room());
            return;
        };
        let manager = Arc::downgrade(self);
        let target = Arc::downgrade(replica);
        let idle = self.config.idle_timeout;

        let timer = handle.spawn(async move {
            tokio::time::sleep(idle).await;
            let (Some(manager), Some(replica)) = (manager.upgrade(), target.upgrade()) else {
                return;
            };
            // Closing aborts the armed timer; this task must not abort itself
            drop(replica.take_idle_timer());
            manager.retire(&replica).await;
        });
        replica.set_idle_timer(timer);
    }

    async fn retire(&self, replica: &Arc<Replica>) {
        {
            let mut registry = lock(&self.registry);
            if replica.listener_count() > 0 || !registry.remove(replica) {
                return;
            }
        }
        log::info!("{}: idle, tearing down replica", replica.room());
        replica.close().await;
    }
}

/// Handle for one registered listener. Unsubscribes on drop.
pub struct Subscription {
    manager: Weak<ManagerInner>,
    replica: Weak<Replica>,
    listener: ListenerId,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(replica) = self.replica.upgrade() else {
            return;
        };
        if replica.remove_listener(self.listener) == Some(0) {
            if let Some(manager) = self.manager.upgrade() {
                if lock(&manager.registry).is_current(&replica) {
                    manager.arm_idle(&replica);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Candidates in order, without duplicates after normalization.
fn dedup_relays(candidates: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .iter()
        .filter(|relay| seen.insert(relay_ws_url(relay)))
        .cloned()
        .collect()
}
