//! Media deduplication cache
//!
//! Resolves a media reference to a local copy through an ordered chain of
//! tiers (content hash, remote id, full download). Both key spaces are
//! persisted together in one snapshot written with atomic replace.
//!
//! - [`store`] - bounded maps with LRU eviction and pinning
//! - [`tiers`] - the resolution strategies

mod store;
mod tiers;

pub use store::{CacheEntry, CacheKey, CacheSnapshot, CacheStore, SnapshotEntry};
pub use tiers::{DownloadTier, HashTier, IdTier, ResolveTier, TierOutcome};

use crate::config::Config;
use crate::error::{PersistError, TransferError};
use crate::source::{HashQuery, MediaFetcher};
use crate::types::{Event, MediaDescriptor, MediaRef, ResolutionTier};
use crate::utils::atomic_write;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedMutexGuard, broadcast};

/// On-disk format version of [`CacheSnapshot`]
pub const CACHE_VERSION: u32 = 1;

type GateMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// RAII pin on one or more cache entries
///
/// While a lease is alive the pinned entries cannot be evicted.
pub struct CacheLease {
    store: Arc<Mutex<CacheStore>>,
    keys: Vec<CacheKey>,
}

impl CacheLease {
    /// Keys held by this lease
    pub fn keys(&self) -> &[CacheKey] {
        &self.keys
    }
}

impl std::fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease").field("keys", &self.keys).finish()
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let mut store = self.store.lock();
        for key in &self.keys {
            store.unpin(key);
        }
    }
}

/// A media reference resolved to a local file
#[derive(Debug)]
pub struct ResolvedMedia {
    /// Local copy of the media
    pub local_path: PathBuf,
    /// Tier that produced it
    pub tier: ResolutionTier,
    /// Bytes transferred (0 for cache hits)
    pub bytes_transferred: u64,
    /// Content hash, when known
    pub content_hash: Option<String>,
    lease: CacheLease,
}

impl ResolvedMedia {
    /// Wrap a resolution together with the lease pinning its cache entries
    pub fn new(
        local_path: PathBuf,
        tier: ResolutionTier,
        bytes_transferred: u64,
        content_hash: Option<String>,
        lease: CacheLease,
    ) -> Self {
        Self {
            local_path,
            tier,
            bytes_transferred,
            content_hash,
            lease,
        }
    }

    /// Cache keys pinned until this value is dropped
    pub fn pinned_keys(&self) -> &[CacheKey] {
        self.lease.keys()
    }
}

/// Holds per-key in-flight gates; released on drop
pub(crate) struct InflightGuard {
    gates: Arc<Mutex<GateMap>>,
    held: Vec<(String, OwnedMutexGuard<()>)>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let held = std::mem::take(&mut self.held);
        let mut gates = self.gates.lock();
        for (key, guard) in held {
            drop(guard);
            // Only the map still references the gate: nobody is waiting
            if let Some(gate) = gates.get(&key)
                && Arc::strong_count(gate) == 1
            {
                gates.remove(&key);
            }
        }
    }
}

/// Shared three-tier media cache
///
/// Every mutation goes through one critical section on the store, so
/// concurrent workers never observe a half-updated map.
pub struct DedupCache {
    store: Arc<Mutex<CacheStore>>,
    tiers: Vec<Box<dyn ResolveTier>>,
    gates: Arc<Mutex<GateMap>>,
    path: PathBuf,
    hash_query_timeout: std::time::Duration,
    persisted_generation: AtomicU64,
    event_tx: broadcast::Sender<Event>,
}

impl DedupCache {
    /// Create an empty cache with the id and download tiers
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn MediaFetcher>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self::with_store(
            CacheStore::new(config.cache.max_size),
            config,
            fetcher,
            event_tx,
        )
    }

    /// Create a cache, loading the persisted snapshot if one exists
    ///
    /// A corrupted or unreadable snapshot is logged and treated as empty.
    pub async fn open(
        config: &Config,
        fetcher: Arc<dyn MediaFetcher>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        let store = load_store(&config.cache.path, config.cache.max_size).await;
        tracing::info!(
            path = %config.cache.path.display(),
            entries = store.len(),
            "Dedup cache loaded"
        );
        Self::with_store(store, config, fetcher, event_tx)
    }

    fn with_store(
        store: CacheStore,
        config: &Config,
        fetcher: Arc<dyn MediaFetcher>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        let generation = store.generation();
        let tiers: Vec<Box<dyn ResolveTier>> = vec![
            Box::new(IdTier),
            Box::new(DownloadTier::new(
                fetcher,
                config.cache.media_dir.clone(),
                config.cache.file_collision,
                config.retry.clone(),
            )),
        ];
        Self {
            store: Arc::new(Mutex::new(store)),
            tiers,
            gates: Arc::new(Mutex::new(HashMap::new())),
            path: config.cache.path.clone(),
            hash_query_timeout: config.cache.hash_query_timeout,
            persisted_generation: AtomicU64::new(generation),
            event_tx,
        }
    }

    /// Put the remote hash-query tier in front of the chain
    #[must_use]
    pub fn with_hash_query(mut self, query: Arc<dyn HashQuery>) -> Self {
        self.tiers.retain(|t| t.tier() != ResolutionTier::Hash);
        self.tiers
            .insert(0, Box::new(HashTier::new(query, self.hash_query_timeout)));
        self
    }

    /// Tiers in the order they are tried
    pub fn tier_order(&self) -> Vec<ResolutionTier> {
        self.tiers.iter().map(|t| t.tier()).collect()
    }

    /// Resolve a media descriptor to a local copy; first tier to hit wins
    ///
    /// The descriptor is filled in as tiers learn more about the media.
    ///
    /// # Errors
    ///
    /// Returns the download tier's error when the media cannot be obtained.
    pub async fn resolve(
        &self,
        descriptor: &mut MediaDescriptor,
    ) -> Result<ResolvedMedia, TransferError> {
        for tier in &self.tiers {
            if let TierOutcome::Hit(resolved) = tier.attempt(descriptor, self).await? {
                descriptor.local_path = Some(resolved.local_path.clone());
                if descriptor.content_hash.is_none() {
                    descriptor.content_hash = resolved.content_hash.clone();
                }
                tracing::debug!(
                    media_ref = %descriptor.remote_ref,
                    tier = %resolved.tier,
                    bytes = resolved.bytes_transferred,
                    "Media resolved"
                );
                return Ok(resolved);
            }
        }

        Err(TransferError::NotFound {
            media_ref: descriptor.remote_ref.to_string(),
        })
    }

    /// Look up a key, refresh its recency and pin it
    ///
    /// Entries whose file has disappeared from disk are dropped and reported
    /// as a miss.
    pub async fn lookup(&self, key: &CacheKey) -> Option<(PathBuf, CacheLease)> {
        self.lookup_aliased(key, None).await
    }

    /// Like [`lookup`](Self::lookup), and on a hit also record `alias` for
    /// the same file
    ///
    /// The alias is pinned for the lifetime of the returned lease. An alias
    /// that is already cached is left alone.
    pub async fn lookup_aliased(
        &self,
        key: &CacheKey,
        alias: Option<CacheKey>,
    ) -> Option<(PathBuf, CacheLease)> {
        let path = {
            let mut store = self.store.lock();
            let path = store.get(key)?;
            store.pin(key);
            path
        };
        let mut lease = CacheLease {
            store: Arc::clone(&self.store),
            keys: vec![key.clone()],
        };

        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(key = %key, path = %path.display(), "Cached media missing on disk, dropping entry");
                drop(lease);
                self.store.lock().remove(key);
                return None;
            }
            Err(e) => {
                // Entry may still be good; only a confirmed absence drops it
                tracing::warn!(key = %key, path = %path.display(), error = %e, "Cannot check cached media, treating as miss");
                return None;
            }
        }

        if let Some(alias) = alias.filter(|a| a != key) {
            let mut store = self.store.lock();
            let size = store.peek(key).map(|e| (e.local_path == path, e.size));
            if let Some((true, size)) = size
                && !store.contains(&alias)
            {
                store.pin(&alias);
                for evicted in store.insert(alias.clone(), &path, size) {
                    tracing::debug!(key = %evicted, "Evicted cache entry");
                }
                tracing::debug!(key = %key, alias = %alias, "Cache entry aliased");
                lease.keys.push(alias);
            }
        }
        Some((path, lease))
    }

    /// Insert one file under several keys in a single critical section
    ///
    /// The keys are pinned before insertion so the new entries cannot be
    /// evicted by their own insert.
    pub fn insert_all(&self, keys: Vec<CacheKey>, local_path: &Path, size: u64) -> CacheLease {
        {
            let mut store = self.store.lock();
            for key in &keys {
                store.pin(key);
                let evicted = store.insert(key.clone(), local_path, size);
                for key in evicted {
                    tracing::debug!(key = %key, "Evicted cache entry");
                }
            }
        }
        CacheLease {
            store: Arc::clone(&self.store),
            keys,
        }
    }

    /// Whether a key is cached, without touching its recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.store.lock().contains(key)
    }

    /// Whether any cached key points at `path`
    pub fn references_path(&self, path: &Path) -> bool {
        self.store.lock().references(path)
    }

    /// Whether a key is currently pinned by an in-flight task
    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.store.lock().is_pinned(key)
    }

    /// Entries across both key spaces
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Serialize both maps
    pub fn snapshot(&self) -> CacheSnapshot {
        self.store.lock().to_snapshot(CACHE_VERSION)
    }

    /// Write the snapshot with atomic replace if anything changed
    ///
    /// Returns whether a write happened.
    pub async fn persist(&self) -> Result<bool, PersistError> {
        let (snapshot, generation) = {
            let store = self.store.lock();
            if store.generation() == self.persisted_generation.load(Ordering::Acquire) {
                return Ok(false);
            }
            (store.to_snapshot(CACHE_VERSION), store.generation())
        };

        let data = serde_json::to_vec(&snapshot).map_err(|e| PersistError::WriteFailed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        atomic_write(&self.path, &data)
            .await
            .map_err(|e| PersistError::WriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        self.persisted_generation.store(generation, Ordering::Release);
        tracing::debug!(
            path = %self.path.display(),
            hashes = snapshot.hashes.len(),
            ids = snapshot.ids.len(),
            "Dedup cache persisted"
        );
        Ok(true)
    }

    /// Serialize transfers of the same media
    ///
    /// Always takes the id gate, then the hash gate when the hash is known.
    /// The fixed order keeps two tasks from waiting on each other.
    pub(crate) async fn acquire_gates(
        &self,
        media_ref: &MediaRef,
        content_hash: Option<&str>,
    ) -> InflightGuard {
        let mut keys = vec![format!("id:{media_ref}")];
        if let Some(hash) = content_hash {
            keys.push(format!("hash:{hash}"));
        }
        self.acquire_keys(keys).await
    }

    /// Serialize writers of one destination path
    ///
    /// Taken after [`acquire_gates`](Self::acquire_gates), never before.
    pub(crate) async fn acquire_path_gate(&self, path: &Path) -> InflightGuard {
        self.acquire_keys(vec![format!("path:{}", path.display())])
            .await
    }

    async fn acquire_keys(&self, keys: Vec<String>) -> InflightGuard {
        let mut guard = InflightGuard {
            gates: Arc::clone(&self.gates),
            held: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let gate = {
                let mut gates = self.gates.lock();
                Arc::clone(gates.entry(key.clone()).or_default())
            };
            let held = gate.lock_owned().await;
            guard.held.push((key, held));
        }
        guard
    }

    pub(crate) fn hash_fallback(&self, media_ref: &MediaRef, reason: String) {
        tracing::debug!(media_ref = %media_ref, reason = %reason, "Hash query fell through to id tier");
        self.event_tx
            .send(Event::HashQueryFallback {
                media_ref: media_ref.clone(),
                reason,
            })
            .ok();
    }
}

async fn load_store(path: &Path, max_size: usize) -> CacheStore {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return CacheStore::new(max_size);
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Dedup cache unreadable, starting empty");
            return CacheStore::new(max_size);
        }
    };

    match serde_json::from_slice::<CacheSnapshot>(&data) {
        Ok(snapshot) if snapshot.version == CACHE_VERSION => {
            CacheStore::from_snapshot(snapshot, max_size)
        }
        Ok(snapshot) => {
            tracing::warn!(
                path = %path.display(),
                found = snapshot.version,
                expected = CACHE_VERSION,
                "Dedup cache has unsupported version, starting empty"
            );
            CacheStore::new(max_size)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Dedup cache corrupted, starting empty");
            CacheStore::new(max_size)
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FetchedMedia, HashLookup};
    use crate::utils::hash_bytes;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes `contents:<ref>` to the destination and counts calls
    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn body(media_ref: &str) -> Vec<u8> {
        format!("contents:{media_ref}").into_bytes()
    }

    #[async_trait]
    impl MediaFetcher for CountingFetcher {
        async fn fetch(
            &self,
            media_ref: &MediaRef,
            dest: &Path,
        ) -> Result<FetchedMedia, TransferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let data = body(media_ref.as_str());
            tokio::fs::write(dest, &data)
                .await
                .map_err(|e| TransferError::io(dest, e))?;
            Ok(FetchedMedia {
                bytes: data.len() as u64,
                content_hash: None,
            })
        }
    }

    struct FixedHashQuery(HashLookup);

    #[async_trait]
    impl HashQuery for FixedHashQuery {
        async fn query_hash(&self, _media_ref: &MediaRef) -> HashLookup {
            self.0.clone()
        }
    }

    struct HangingHashQuery;

    #[async_trait]
    impl HashQuery for HangingHashQuery {
        async fn query_hash(&self, _media_ref: &MediaRef) -> HashLookup {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            HashLookup::Unavailable("unreachable".into())
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.cache.path = dir.path().join("cache.json");
        config.cache.media_dir = dir.path().join("media");
        config.cache.hash_query_timeout = Duration::from_millis(50);
        config.retry.max_attempts = 0;
        config
    }

    fn descriptor(media_ref: &str) -> MediaDescriptor {
        MediaDescriptor::new(MediaRef::new(media_ref), 0)
    }

    #[tokio::test]
    async fn first_resolve_downloads_then_id_tier_hits() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new();
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&test_config(&dir), fetcher.clone(), tx);

        let mut first = descriptor("photo-1");
        let resolved = cache.resolve(&mut first).await.unwrap();
        assert_eq!(resolved.tier, ResolutionTier::Downloaded);
        assert_eq!(resolved.bytes_transferred, body("photo-1").len() as u64);
        assert_eq!(first.content_hash.as_deref(), Some(hash_bytes(&body("photo-1")).as_str()));
        assert_eq!(first.local_path.as_ref(), Some(&resolved.local_path));
        drop(resolved);

        let mut again = descriptor("photo-1");
        let resolved = cache.resolve(&mut again).await.unwrap();
        assert_eq!(resolved.tier, ResolutionTier::Id);
        assert_eq!(resolved.bytes_transferred, 0);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.len(), 2, "hash and id keys");
    }

    #[tokio::test]
    async fn hash_tier_hits_across_different_remote_ids() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new();
        let (tx, _rx) = broadcast::channel(16);
        let expected_hash = hash_bytes(&body("original"));
        let cache = DedupCache::new(&test_config(&dir), fetcher.clone(), tx).with_hash_query(
            Arc::new(FixedHashQuery(HashLookup::Found(expected_hash.clone()))),
        );
        assert_eq!(
            cache.tier_order(),
            vec![ResolutionTier::Hash, ResolutionTier::Id, ResolutionTier::Downloaded]
        );

        let first = cache.resolve(&mut descriptor("original")).await.unwrap();
        assert_eq!(first.tier, ResolutionTier::Downloaded);

        let forwarded = cache.resolve(&mut descriptor("forwarded-copy")).await.unwrap();
        assert_eq!(forwarded.tier, ResolutionTier::Hash);
        assert_eq!(forwarded.local_path, first.local_path);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn hash_query_timeout_falls_back_and_emits_event() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new();
        let (tx, mut rx) = broadcast::channel(16);
        let cache = DedupCache::new(&test_config(&dir), fetcher.clone(), tx)
            .with_hash_query(Arc::new(HangingHashQuery));

        let resolved = cache.resolve(&mut descriptor("slow-remote")).await.unwrap();
        assert_eq!(resolved.tier, ResolutionTier::Downloaded);

        match rx.try_recv().unwrap() {
            Event::HashQueryFallback { media_ref, reason } => {
                assert_eq!(media_ref.as_str(), "slow-remote");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Queried again for the next item; no permanent demotion
        cache.resolve(&mut descriptor("slow-remote-2")).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::HashQueryFallback { .. }
        ));
    }

    #[tokio::test]
    async fn remote_hash_mismatch_fails_the_item() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new();
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&test_config(&dir), fetcher, tx).with_hash_query(Arc::new(
            FixedHashQuery(HashLookup::Found("00".repeat(32))),
        ));

        let err = cache.resolve(&mut descriptor("liar")).await.unwrap_err();
        assert!(matches!(err, TransferError::HashMismatch { .. }));
        assert!(cache.is_empty());
        let leftover = dir.path().join("media").join("liar");
        assert!(!leftover.exists(), "partial download cleaned up");
    }

    #[tokio::test]
    async fn concurrent_same_media_downloads_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::slow(Duration::from_millis(50));
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&test_config(&dir), fetcher.clone(), tx);

        let mut a = descriptor("shared");
        let mut b = descriptor("shared");
        let (ra, rb) = tokio::join!(cache.resolve(&mut a), cache.resolve(&mut b));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(ra.local_path, rb.local_path);
        let mut tiers = [ra.tier, rb.tier];
        tiers.sort_by_key(|t| *t as u8);
        assert_eq!(tiers, [ResolutionTier::Id, ResolutionTier::Downloaded]);
        assert!(cache.gates.lock().is_empty(), "gates released");
    }

    #[tokio::test]
    async fn resolved_entries_stay_pinned_until_dropped() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.cache.max_size = 2;
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&config, CountingFetcher::new(), tx);

        let held = cache.resolve(&mut descriptor("held")).await.unwrap();
        let held_id = CacheKey::Id("held".into());
        assert!(cache.is_pinned(&held_id));

        let other = cache.resolve(&mut descriptor("other")).await.unwrap();
        drop(other);
        assert!(cache.contains(&held_id), "pinned entry survived eviction");

        drop(held);
        assert!(!cache.is_pinned(&held_id));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn evicted_media_is_downloaded_again() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        // room for one media item: its hash key and its id key
        config.cache.max_size = 2;
        let fetcher = CountingFetcher::new();
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&config, fetcher.clone(), tx);

        drop(cache.resolve(&mut descriptor("a")).await.unwrap());
        drop(cache.resolve(&mut descriptor("b")).await.unwrap());
        assert!(!cache.contains(&CacheKey::Id("a".into())));

        let again = cache.resolve(&mut descriptor("a")).await.unwrap();
        assert_eq!(again.tier, ResolutionTier::Downloaded);
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(cache.len(), 2);
        // eviction forgets the mapping but leaves the first copy on disk
        assert!(config.cache.media_dir.join("a").exists());
    }

    #[tokio::test]
    async fn stale_entry_with_missing_file_is_redownloaded() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new();
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&test_config(&dir), fetcher.clone(), tx);

        let first = cache.resolve(&mut descriptor("gone")).await.unwrap();
        let path = first.local_path.clone();
        drop(first);
        std::fs::remove_file(&path).unwrap();

        let second = cache.resolve(&mut descriptor("gone")).await.unwrap();
        assert_eq!(second.tier, ResolutionTier::Downloaded);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn persist_and_reopen_keeps_entries() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let fetcher = CountingFetcher::new();
        let (tx, _rx) = broadcast::channel(16);

        let cache = DedupCache::new(&config, fetcher.clone(), tx.clone());
        drop(cache.resolve(&mut descriptor("keep")).await.unwrap());
        assert!(cache.persist().await.unwrap());
        assert!(!cache.persist().await.unwrap(), "unchanged cache is not rewritten");

        let reopened = DedupCache::open(&config, fetcher.clone(), tx).await;
        assert_eq!(reopened.len(), 2);
        let hit = reopened.resolve(&mut descriptor("keep")).await.unwrap();
        assert_eq!(hit.tier, ResolutionTier::Id);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn corrupted_snapshot_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.cache.path, b"{ not json").unwrap();
        let (tx, _rx) = broadcast::channel(16);

        let cache = DedupCache::open(&config, CountingFetcher::new(), tx).await;
        assert!(cache.is_empty());
        let resolved = cache.resolve(&mut descriptor("fresh")).await.unwrap();
        assert_eq!(resolved.tier, ResolutionTier::Downloaded);
    }

    /// Writes a few bytes, then never finishes
    struct StalledFetcher;

    #[async_trait]
    impl MediaFetcher for StalledFetcher {
        async fn fetch(
            &self,
            _media_ref: &MediaRef,
            dest: &Path,
        ) -> Result<FetchedMedia, TransferError> {
            tokio::fs::write(dest, b"half")
                .await
                .map_err(|e| TransferError::io(dest, e))?;
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn refs_sharing_a_file_name_download_to_separate_files() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::slow(Duration::from_millis(50));
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&test_config(&dir), fetcher.clone(), tx);

        let mut colon = descriptor("chat:photo");
        let mut slash = descriptor("chat/photo");
        let (a, b) = tokio::join!(cache.resolve(&mut colon), cache.resolve(&mut slash));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(fetcher.calls(), 2);
        assert_ne!(a.local_path, b.local_path);
        assert_eq!(std::fs::read(&a.local_path).unwrap(), body("chat:photo"));
        assert_eq!(std::fs::read(&b.local_path).unwrap(), body("chat/photo"));
    }

    #[tokio::test]
    async fn overwrite_policy_keeps_other_entries_files_intact() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.cache.file_collision = crate::config::FileCollisionAction::Overwrite;
        let fetcher = CountingFetcher::slow(Duration::from_millis(50));
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&config, fetcher.clone(), tx);

        let mut colon = descriptor("chat:photo");
        let mut slash = descriptor("chat/photo");
        let (a, b) = tokio::join!(cache.resolve(&mut colon), cache.resolve(&mut slash));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.local_path, b.local_path);
        assert_eq!(std::fs::read(&a.local_path).unwrap(), body("chat:photo"));
        assert_eq!(std::fs::read(&b.local_path).unwrap(), body("chat/photo"));
        assert!(cache.gates.lock().is_empty());

        // An uncached leftover at the target is still overwritten
        std::fs::write(config.cache.media_dir.join("fresh"), b"stale").unwrap();
        let fresh = cache.resolve(&mut descriptor("fresh")).await.unwrap();
        assert_eq!(fresh.local_path, config.cache.media_dir.join("fresh"));
        assert_eq!(std::fs::read(&fresh.local_path).unwrap(), body("fresh"));
    }

    #[tokio::test]
    async fn id_hit_records_the_known_hash_for_later_copies() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let fetcher = CountingFetcher::new();
        let (tx, _rx) = broadcast::channel(16);
        let content_hash = hash_bytes(&body("a"));
        let cache = DedupCache::new(&config, fetcher.clone(), tx).with_hash_query(Arc::new(
            FixedHashQuery(HashLookup::Found(content_hash.clone())),
        ));

        // Known by id only, as after a run without hash queries
        std::fs::create_dir_all(&config.cache.media_dir).unwrap();
        let existing = config.cache.media_dir.join("a");
        std::fs::write(&existing, body("a")).unwrap();
        drop(cache.insert_all(vec![CacheKey::Id("a".into())], &existing, 9));

        let first = cache.resolve(&mut descriptor("a")).await.unwrap();
        assert_eq!(first.tier, ResolutionTier::Id);
        let hash_key = CacheKey::Hash(content_hash);
        assert!(cache.contains(&hash_key));
        assert!(first.pinned_keys().contains(&hash_key));
        drop(first);
        assert!(!cache.is_pinned(&hash_key));

        let copy = cache.resolve(&mut descriptor("b")).await.unwrap();
        assert_eq!(copy.tier, ResolutionTier::Hash);
        assert_eq!(copy.local_path, existing);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn abandoned_download_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&config, Arc::new(StalledFetcher), tx);

        let mut stuck = descriptor("stuck");
        let result =
            tokio::time::timeout(Duration::from_millis(100), cache.resolve(&mut stuck)).await;
        assert!(result.is_err(), "fetch never completes");

        let leftovers: Vec<_> = std::fs::read_dir(&config.cache.media_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
        assert!(cache.is_empty());
        assert!(cache.gates.lock().is_empty());
    }

    #[tokio::test]
    async fn unreadable_location_keeps_the_entry() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let cache = DedupCache::new(&test_config(&dir), CountingFetcher::new(), tx);

        // A regular file where a directory should be: the check errors
        // instead of reporting the media as missing
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let key = CacheKey::Id("behind-blocker".into());
        drop(cache.insert_all(vec![key.clone()], &blocker.join("media"), 1));

        assert!(cache.lookup(&key).await.is_none());
        assert!(cache.contains(&key));
        assert!(!cache.is_pinned(&key));

        // A confirmed absence still drops it
        let gone = CacheKey::Id("gone".into());
        drop(cache.insert_all(vec![gone.clone()], &dir.path().join("nothing-here"), 1));
        assert!(cache.lookup(&gone).await.is_none());
        assert!(!cache.contains(&gone));
    }

    #[tokio::test]
    async fn skip_collision_policy_fails_when_target_exists() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.cache.file_collision = crate::config::FileCollisionAction::Skip;
        std::fs::create_dir_all(&config.cache.media_dir).unwrap();
        std::fs::write(config.cache.media_dir.join("taken"), b"existing").unwrap();
        let (tx, _rx) = broadcast::channel(16);

        let cache = DedupCache::new(&config, CountingFetcher::new(), tx);
        let err = cache.resolve(&mut descriptor("taken")).await.unwrap_err();
        assert!(matches!(err, TransferError::Collision { .. }));
        assert_eq!(
            std::fs::read(config.cache.media_dir.join("taken")).unwrap(),
            b"existing"
        );
    }
}
