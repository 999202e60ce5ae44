//! In-memory collaborators: upstream source, media fetcher, hash query, writer

use async_trait::async_trait;
use chat_export::utils::hash_bytes;
use chat_export::{
    BatchResult, Cursor, DownstreamWriter, Error, FetchedMedia, HashLookup, HashQuery,
    MediaFetcher, MediaRef, Page, TransferError, UpstreamSource, WorkItem,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// `count` items with ids 1..=count; every `media_every`th item carries media `m<id>`
pub fn make_items(count: u64, media_every: u64) -> Vec<WorkItem> {
    (1..=count)
        .map(|id| {
            if media_every > 0 && id % media_every == 0 {
                WorkItem::with_media(id, format!("m{id}"), 64)
            } else {
                WorkItem::text(id)
            }
        })
        .collect()
}

/// Serves a fixed item list in pages; the cursor is the start offset
pub struct VecSource {
    items: Vec<WorkItem>,
    page_size: usize,
    failures_left: AtomicUsize,
    failure: Mutex<Option<String>>,
    pulls: Mutex<Vec<Option<Cursor>>>,
}

impl VecSource {
    pub fn new(items: Vec<WorkItem>, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            items,
            page_size,
            failures_left: AtomicUsize::new(0),
            failure: Mutex::new(None),
            pulls: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `times` pulls with `Error::Source(message)`
    pub fn failing(items: Vec<WorkItem>, page_size: usize, times: usize, message: &str) -> Arc<Self> {
        let source = Self::new(items, page_size);
        source.failures_left.store(times, Ordering::SeqCst);
        *source.failure.lock() = Some(message.to_string());
        source
    }

    /// Cursors passed to every successful or failed pull
    pub fn pulls(&self) -> Vec<Option<Cursor>> {
        self.pulls.lock().clone()
    }
}

#[async_trait]
impl UpstreamSource for VecSource {
    async fn next_batch(&self, cursor: Option<&Cursor>) -> chat_export::Result<Page> {
        self.pulls.lock().push(cursor.cloned());

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let message = self.failure.lock().clone().unwrap_or_default();
            return Err(Error::Source(message));
        }

        let start = match cursor {
            Some(c) => c
                .0
                .parse::<usize>()
                .map_err(|e| Error::Source(format!("bad cursor {c}: {e}")))?,
            None => 0,
        };
        let end = (start + self.page_size).min(self.items.len());
        let items = self.items[start.min(end)..end].to_vec();
        let next_cursor = (end < self.items.len()).then(|| Cursor::new(end.to_string()));
        Ok(Page { items, next_cursor })
    }
}

/// Content written for a media reference unless overridden
pub fn default_body(media_ref: &str) -> Vec<u8> {
    format!("media-bytes:{media_ref}").into_bytes()
}

/// Writes deterministic bytes for each reference and records what it did
#[derive(Default)]
pub struct MemoryFetcher {
    bodies: HashMap<String, Vec<u8>>,
    fail_refs: HashSet<String>,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    fetched: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    /// References in `fail` always fail with a permanent not-found error
    pub fn with_failures(fail: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_refs: fail.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    /// Serve `body` for the given references
    pub fn with_bodies(bodies: &[(&str, &[u8])]) -> Arc<Self> {
        Arc::new(Self {
            bodies: bodies
                .iter()
                .map(|(r, b)| (r.to_string(), b.to_vec()))
                .collect(),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    pub fn body(&self, media_ref: &str) -> Vec<u8> {
        self.bodies
            .get(media_ref)
            .cloned()
            .unwrap_or_else(|| default_body(media_ref))
    }
}

#[async_trait]
impl MediaFetcher for MemoryFetcher {
    async fn fetch(&self, media_ref: &MediaRef, dest: &Path) -> Result<FetchedMedia, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = if self.fail_refs.contains(media_ref.as_str()) {
            Err(TransferError::NotFound {
                media_ref: media_ref.to_string(),
            })
        } else {
            let data = self.body(media_ref.as_str());
            match tokio::fs::write(dest, &data).await {
                Ok(()) => {
                    self.fetched.lock().push(media_ref.to_string());
                    Ok(FetchedMedia {
                        bytes: data.len() as u64,
                        content_hash: None,
                    })
                }
                Err(e) => Err(TransferError::io(dest, e)),
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Answers hash queries from a fixed map; unknown references are unavailable
pub struct MapHashQuery {
    hashes: HashMap<String, String>,
    queries: AtomicUsize,
}

impl MapHashQuery {
    pub fn new(entries: &[(&str, &[u8])]) -> Arc<Self> {
        Arc::new(Self {
            hashes: entries
                .iter()
                .map(|(r, body)| (r.to_string(), hash_bytes(body)))
                .collect(),
            queries: AtomicUsize::new(0),
        })
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HashQuery for MapHashQuery {
    async fn query_hash(&self, media_ref: &MediaRef) -> HashLookup {
        self.queries.fetch_add(1, Ordering::SeqCst);
        match self.hashes.get(media_ref.as_str()) {
            Some(hash) => HashLookup::Found(hash.clone()),
            None => HashLookup::Unavailable("remote does not expose hashes".into()),
        }
    }
}

/// Records committed batches; can fail or stall on a chosen commit
#[derive(Default)]
pub struct RecordingWriter {
    batches: Mutex<Vec<BatchResult>>,
    fail_at: Option<usize>,
    stall_at: Option<usize>,
    commits: AtomicUsize,
    pub stalled: Arc<Notify>,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject the commit with this 0-based index
    pub fn failing_at(index: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_at: Some(index),
            ..Default::default()
        })
    }

    /// Never return from the commit with this 0-based index, as if the
    /// process had died mid-write
    pub fn stalling_at(index: usize) -> Arc<Self> {
        Arc::new(Self {
            stall_at: Some(index),
            ..Default::default()
        })
    }

    pub fn batches(&self) -> Vec<BatchResult> {
        self.batches.lock().clone()
    }

    /// Sequence ids across all committed batches, in commit order
    pub fn committed_ids(&self) -> Vec<u64> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.items.iter().map(|r| r.sequence_id.get()))
            .collect()
    }
}

#[async_trait]
impl DownstreamWriter for RecordingWriter {
    async fn commit(&self, batch: &BatchResult) -> chat_export::Result<()> {
        let index = self.commits.fetch_add(1, Ordering::SeqCst);
        if self.stall_at == Some(index) {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        if self.fail_at == Some(index) {
            return Err(Error::Other("disk full".into()));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}
