//! Durable per-room fallback cache.
//!
//! One JSON file per room:
//! ```text
//! <cache_dir>/profile-alice.json
//! {"document":{...},"cachedAt":1700000000000,"sourceRelay":"ws://relay-a:9090"}
//! ```
//!
//! The cache is an optimization, never a correctness dependency: every I/O
//! or parse failure is logged and reported as a miss. Freshness is decided
//! by the caller; entries are never expired on their own.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::document::Document;
use crate::protocol::{unix_millis, RoomId};

/// One persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub document: Document,
    /// Milliseconds since the Unix epoch
    pub cached_at: u64,
    pub source_relay: Option<String>,
}

impl CacheEntry {
    pub fn new(document: Document, source_relay: Option<&str>) -> Self {
        Self {
            document,
            cached_at: unix_millis(),
            source_relay: source_relay.map(str::to_string),
        }
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(unix_millis().saturating_sub(self.cached_at))
    }

    /// Younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Directory-backed cache, cheap to clone.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: Arc<PathBuf>,
    /// Distinguishes temp files of concurrent writers
    write_seq: Arc<AtomicU64>,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
            write_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, room: &RoomId) -> PathBuf {
        self.dir.join(format!("{room}.json"))
    }

    /// Read the entry for `room`. Missing or corrupt files are a miss.
    pub async fn get(&self, room: &RoomId) -> Option<CacheEntry> {
        let path = self.path_for(room);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Cache read failed for {room} at {}: {e}", path.display());
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Ignoring corrupt cache entry for {room}: {e}");
                None
            }
        }
    }

    /// Overwrite the entry for `room`. Failures are logged and swallowed.
    pub async fn put(&self, room: &RoomId, document: &Document, source_relay: Option<&str>) {
        let entry = CacheEntry::new(document.clone(), source_relay);
        if let Err(e) = self.put_entry(room, &entry).await {
            log::warn!("Cache write failed for {room}: {e}");
        }
    }

    /// Write a complete entry, replacing the file atomically.
    pub async fn put_entry(&self, room: &RoomId, entry: &CacheEntry) -> io::Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::create_dir_all(self.dir.as_path()).await?;

        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(".{room}.{seq}.tmp"));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(room)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        log::trace!("Cached {room} ({} bytes)", bytes.len());
        Ok(())
    }

    /// Delete entries older than `max_age`. Returns how many were removed.
    pub async fn prune_older_than(&self, max_age: Duration) -> usize {
        let mut dir = match tokio::fs::read_dir(self.dir.as_path()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                log::warn!("Cache prune could not list {}: {e}", self.dir.display());
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes)
                    .map(|entry| entry.age() > max_age)
                    .unwrap_or(true),
                Err(_) => false,
            };
            if expired {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => log::warn!("Cache prune failed for {}: {e}", path.display()),
                }
            }
        }
        if removed > 0 {
            log::info!("Pruned {removed} cache entries older than {max_age:?}");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: i64) -> Document {
        Document::new(json!({ "v": v }))
    }

    #[tokio::test]
    async fn test_missing_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"));
        assert!(cache.get(&RoomId::for_document("nobody")).await.is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("nested").join("cache"));
        let room = RoomId::for_document("alice");

        cache.put(&room, &doc(1), Some("ws://relay-a")).await;
        let entry = cache.get(&room).await.unwrap();
        assert_eq!(entry.document, doc(1));
        assert_eq!(entry.source_relay.as_deref(), Some("ws://relay-a"));
        assert!(entry.is_fresh(Duration::from_secs(300)));

        cache.put(&room, &doc(2), None).await;
        let entry = cache.get(&room).await.unwrap();
        assert_eq!(entry.document, doc(2));
        assert!(entry.source_relay.is_none());
    }

    #[tokio::test]
    async fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let room = RoomId::for_document("alice");
        cache.put(&room, &doc(7), Some("ws://a")).await;

        let raw = std::fs::read_to_string(dir.path().join("profile-alice.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["document"]["v"], 7);
        assert_eq!(value["sourceRelay"], "ws://a");
        assert!(value["cachedAt"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        std::fs::write(dir.path().join("profile-alice.json"), b"{ not json").unwrap();
        assert!(cache.get(&RoomId::for_document("alice")).await.is_none());
    }

    #[tokio::test]
    async fn test_unwritable_dir_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        // A regular file where the cache directory should be
        let cache = DiskCache::new(&blocker);
        let room = RoomId::for_document("alice");

        cache.put(&room, &doc(1), None).await;
        assert!(cache.get(&room).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_entry_still_readable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let room = RoomId::for_document("alice");
        let entry = CacheEntry {
            document: doc(0),
            cached_at: unix_millis() - 3_600_000,
            source_relay: Some("ws://a".into()),
        };
        cache.put_entry(&room, &entry).await.unwrap();

        let read = cache.get(&room).await.unwrap();
        assert!(!read.is_fresh(Duration::from_secs(300)));
        assert_eq!(read.document, doc(0));
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let old = RoomId::for_document("old");
        let new = RoomId::for_document("new");
        cache
            .put_entry(
                &old,
                &CacheEntry {
                    document: doc(0),
                    cached_at: unix_millis() - 7_200_000,
                    source_relay: None,
                },
            )
            .await
            .unwrap();
        cache.put(&new, &doc(1), None).await;

        assert_eq!(cache.prune_older_than(Duration::from_secs(3600)).await, 1);
        assert!(cache.get(&old).await.is_none());
        assert!(cache.get(&new).await.is_some());
    }
}
