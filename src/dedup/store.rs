//! In-memory cache maps with least-recently-accessed eviction and pinning.
//!
//! Hash keys and remote-id keys live in separate key spaces but share one
//! capacity and one recency order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Lookup key: either a content hash or a remote identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Content hash (hex)
    Hash(String),
    /// Remote media identifier
    Id(String),
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Hash(h) => write!(f, "hash:{h}"),
            CacheKey::Id(id) => write!(f, "id:{id}"),
        }
    }
}

/// One cached mapping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Local copy of the media
    pub local_path: PathBuf,
    /// Last hit or insert
    pub last_access: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    tick: u64,
}

/// Serialized entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Hash or remote id, depending on the map it appears in
    pub key: String,
    /// Local copy of the media
    pub local_path: PathBuf,
    /// Last hit or insert
    pub last_access: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
}

/// Serialized cache: both maps plus access metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Format version
    pub version: u32,
    /// hash -> path
    pub hashes: Vec<SnapshotEntry>,
    /// remote id -> path
    pub ids: Vec<SnapshotEntry>,
}

/// Cache contents; callers serialize access through one lock
#[derive(Debug)]
pub struct CacheStore {
    entries: HashMap<CacheKey, CacheEntry>,
    // tick -> key, oldest first
    order: BTreeMap<u64, CacheKey>,
    pins: HashMap<CacheKey, usize>,
    // local path -> number of keys pointing at it
    paths: HashMap<PathBuf, usize>,
    next_tick: u64,
    max_size: usize,
    generation: u64,
}

impl CacheStore {
    /// Empty store bounded to `max_size` entries
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            pins: HashMap::new(),
            paths: HashMap::new(),
            next_tick: 0,
            max_size: max_size.max(1),
            generation: 0,
        }
    }

    /// Number of entries across both key spaces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Counter bumped on every mutation; used to skip redundant persists
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a key is present, without touching its recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether any key maps to `path`
    pub fn references(&self, path: &Path) -> bool {
        self.paths.contains_key(path)
    }

    /// Read an entry without touching its recency
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Look up a key, marking it most recently used on a hit
    pub fn get(&mut self, key: &CacheKey) -> Option<PathBuf> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.local_path.clone())
    }

    /// Insert a mapping and return the keys evicted to stay within capacity
    ///
    /// Inserting an existing key only refreshes its access time; the stored
    /// path is kept.
    pub fn insert(&mut self, key: CacheKey, local_path: &Path, size: u64) -> Vec<CacheKey> {
        if self.entries.contains_key(&key) {
            self.touch(&key);
            return Vec::new();
        }

        let tick = self.bump_tick();
        self.order.insert(tick, key.clone());
        self.index_path(local_path);
        self.entries.insert(
            key,
            CacheEntry {
                local_path: local_path.to_path_buf(),
                last_access: Utc::now(),
                size,
                tick,
            },
        );
        self.generation += 1;
        self.evict_excess()
    }

    /// Drop a mapping regardless of pins
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.unindex_path(&entry.local_path);
        self.generation += 1;
        Some(entry)
    }

    /// Protect a key from eviction until a matching [`unpin`](Self::unpin)
    pub fn pin(&mut self, key: &CacheKey) {
        *self.pins.entry(key.clone()).or_insert(0) += 1;
    }

    /// Release one pin on a key
    pub fn unpin(&mut self, key: &CacheKey) {
        if let Some(count) = self.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(key);
            }
        }
        // Entries kept over capacity while pinned can go now
        if self.entries.len() > self.max_size {
            self.evict_excess();
        }
    }

    /// Whether a key is pinned
    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.pins.contains_key(key)
    }

    /// Serialize both maps
    pub fn to_snapshot(&self, version: u32) -> CacheSnapshot {
        let mut snapshot = CacheSnapshot {
            version,
            ..Default::default()
        };
        // Oldest first, so a reload rebuilds the same recency order
        for key in self.order.values() {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            let (list, raw) = match key {
                CacheKey::Hash(h) => (&mut snapshot.hashes, h),
                CacheKey::Id(id) => (&mut snapshot.ids, id),
            };
            list.push(SnapshotEntry {
                key: raw.clone(),
                local_path: entry.local_path.clone(),
                last_access: entry.last_access,
                size: entry.size,
            });
        }
        snapshot
    }

    /// Rebuild from a snapshot, evicting down to `max_size` if needed
    pub fn from_snapshot(snapshot: CacheSnapshot, max_size: usize) -> Self {
        let mut all: Vec<(CacheKey, SnapshotEntry)> = snapshot
            .hashes
            .into_iter()
            .map(|e| (CacheKey::Hash(e.key.clone()), e))
            .chain(
                snapshot
                    .ids
                    .into_iter()
                    .map(|e| (CacheKey::Id(e.key.clone()), e)),
            )
            .collect();
        all.sort_by_key(|(_, e)| e.last_access);

        let mut store = Self::new(max_size);
        for (key, entry) in all {
            if store.entries.contains_key(&key) {
                continue;
            }
            let tick = store.bump_tick();
            store.order.insert(tick, key.clone());
            store.index_path(&entry.local_path);
            store.entries.insert(
                key,
                CacheEntry {
                    local_path: entry.local_path,
                    last_access: entry.last_access,
                    size: entry.size,
                    tick,
                },
            );
        }
        store.evict_excess();
        store
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn index_path(&mut self, path: &Path) {
        *self.paths.entry(path.to_path_buf()).or_insert(0) += 1;
    }

    fn unindex_path(&mut self, path: &Path) {
        if let Some(count) = self.paths.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                self.paths.remove(path);
            }
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        let tick = self.bump_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            entry.last_access = Utc::now();
            self.order.insert(tick, key.clone());
            self.generation += 1;
        }
    }

    fn evict_excess(&mut self) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_size {
            let victim = self
                .order
                .iter()
                .find(|(_, key)| !self.pins.contains_key(*key))
                .map(|(tick, key)| (*tick, key.clone()));

            let Some((tick, key)) = victim else {
                tracing::debug!(
                    entries = self.entries.len(),
                    max_size = self.max_size,
                    "All eviction candidates pinned, cache temporarily over capacity"
                );
                break;
            };
            self.order.remove(&tick);
            if let Some(entry) = self.entries.remove(&key) {
                self.unindex_path(&entry.local_path);
            }
            self.generation += 1;
            evicted.push(key);
        }
        evicted
    }
}
