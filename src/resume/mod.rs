//! Resume filter: bounded-memory "already committed" membership plus the
//! upstream cursor, checkpointed to disk for restart safety.
//!
//! - [`bloom`] - the probabilistic bitset
//!
//! A "maybe seen" answer is treated as seen. The filter never forgets an id
//! it recorded, and reports an unrecorded id as seen at roughly the
//! configured false-positive rate.

mod bloom;

pub use bloom::{BloomFilter, BloomSnapshot};

use crate::config::ResumeConfig;
use crate::error::PersistError;
use crate::types::{Cursor, SequenceId};
use crate::utils::atomic_write;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// On-disk format version of [`ResumeSnapshot`]
pub const CHECKPOINT_VERSION: u32 = 1;

/// Persisted resume state: filter bits, sizing parameters and cursor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    /// Format version
    pub version: u32,
    /// Filter contents
    pub filter: BloomSnapshot,
    /// Item count the filter was sized for
    pub expected_items: u64,
    /// False-positive target the filter was sized for
    pub false_positive_rate: f64,
    /// Upstream cursor after the last committed batch
    pub cursor: Option<Cursor>,
    /// Ids recorded up to this snapshot
    pub recorded: u64,
    /// When the snapshot was taken
    pub saved_at: DateTime<Utc>,
}

struct ResumeState {
    filter: BloomFilter,
    expected_items: u64,
    false_positive_rate: f64,
    cursor: Option<Cursor>,
    recorded: u64,
    since_checkpoint: u64,
    last_checkpoint: Instant,
}

impl ResumeState {
    fn to_snapshot(&self) -> ResumeSnapshot {
        ResumeSnapshot {
            version: CHECKPOINT_VERSION,
            filter: self.filter.to_snapshot(),
            expected_items: self.expected_items,
            false_positive_rate: self.false_positive_rate,
            cursor: self.cursor.clone(),
            recorded: self.recorded,
            saved_at: Utc::now(),
        }
    }
}

/// Shared resume filter
///
/// Every access goes through one lock, so readers never see a
/// half-recorded batch.
pub struct ResumeFilter {
    path: PathBuf,
    checkpoint_every_items: u64,
    checkpoint_interval: std::time::Duration,
    state: Mutex<ResumeState>,
}

impl ResumeFilter {
    /// Create an empty filter sized from the configuration
    pub fn new(config: &ResumeConfig) -> Self {
        let filter = BloomFilter::with_rate(config.expected_items, config.false_positive_rate);
        tracing::debug!(
            num_bits = filter.num_bits(),
            num_hashes = filter.num_hashes(),
            expected_items = config.expected_items,
            "Created resume filter"
        );
        Self {
            path: config.path.clone(),
            checkpoint_every_items: config.checkpoint_every_items,
            checkpoint_interval: config.checkpoint_interval,
            state: Mutex::new(ResumeState {
                filter,
                expected_items: config.expected_items,
                false_positive_rate: config.false_positive_rate,
                cursor: None,
                recorded: 0,
                since_checkpoint: 0,
                last_checkpoint: Instant::now(),
            }),
        }
    }

    /// Create a filter and restore the last checkpoint from disk if present
    ///
    /// A missing checkpoint starts fresh. An unreadable or corrupted one is
    /// logged and also starts fresh; the resulting redundant work is safe.
    pub async fn open(config: &ResumeConfig) -> Self {
        let filter = Self::new(config);
        match load_snapshot(&config.path).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = filter.restore(snapshot) {
                    tracing::warn!(path = %config.path.display(), error = %e, "Discarding unusable checkpoint");
                }
            }
            Ok(None) => {
                tracing::info!(path = %config.path.display(), "No checkpoint found, starting fresh");
            }
            Err(e) => {
                tracing::warn!(path = %config.path.display(), error = %e, "Checkpoint unreadable, starting fresh");
            }
        }
        filter
    }

    /// Whether the id may already have been committed
    pub fn seen(&self, id: SequenceId) -> bool {
        self.state.lock().filter.contains(&id.to_bytes())
    }

    /// Mark an id as committed
    pub fn record(&self, id: SequenceId) {
        self.record_all(std::iter::once(id));
    }

    /// Mark several ids as committed in one critical section
    pub fn record_all(&self, ids: impl IntoIterator<Item = SequenceId>) {
        let mut state = self.state.lock();
        for id in ids {
            state.filter.insert(&id.to_bytes());
            state.recorded += 1;
            state.since_checkpoint += 1;
        }
    }

    /// Cursor after the last committed batch
    pub fn cursor(&self) -> Option<Cursor> {
        self.state.lock().cursor.clone()
    }

    /// Advance the cursor once a batch is committed
    pub fn set_cursor(&self, cursor: Option<Cursor>) {
        self.state.lock().cursor = cursor;
    }

    /// Ids recorded in total (including restored ones)
    pub fn recorded(&self) -> u64 {
        self.state.lock().recorded
    }

    /// Whether enough items or time have passed since the last checkpoint
    pub fn checkpoint_due(&self) -> bool {
        let state = self.state.lock();
        if state.since_checkpoint == 0 {
            return false;
        }
        state.since_checkpoint >= self.checkpoint_every_items
            || state.last_checkpoint.elapsed() >= self.checkpoint_interval
    }

    /// Capture the current state without persisting it
    pub fn snapshot(&self) -> ResumeSnapshot {
        self.state.lock().to_snapshot()
    }

    /// Persist the current state with atomic replace and return what was written
    pub async fn checkpoint(&self) -> Result<ResumeSnapshot, PersistError> {
        let (snapshot, captured) = {
            let state = self.state.lock();
            (state.to_snapshot(), state.since_checkpoint)
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

        {
            let mut state = self.state.lock();
            state.since_checkpoint = state.since_checkpoint.saturating_sub(captured);
            state.last_checkpoint = Instant::now();
        }

        tracing::debug!(
            path = %self.path.display(),
            recorded = snapshot.recorded,
            cursor = ?snapshot.cursor,
            "Checkpoint written"
        );
        Ok(snapshot)
    }

    /// Replace the in-memory state with a snapshot
    ///
    /// The snapshot's own sizing wins over the configured one: resizing
    /// would drop recorded ids.
    pub fn restore(&self, snapshot: ResumeSnapshot) -> Result<(), PersistError> {
        if snapshot.version != CHECKPOINT_VERSION {
            return Err(PersistError::UnsupportedVersion {
                path: self.path.clone(),
                found: snapshot.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        let filter =
            BloomFilter::from_snapshot(&snapshot.filter).map_err(|reason| PersistError::Corrupted {
                path: self.path.clone(),
                reason,
            })?;

        let mut state = self.state.lock();
        if snapshot.expected_items != state.expected_items {
            tracing::info!(
                configured = state.expected_items,
                restored = snapshot.expected_items,
                "Checkpoint was sized for a different item count, keeping its sizing"
            );
        }
        state.filter = filter;
        state.expected_items = snapshot.expected_items;
        state.false_positive_rate = snapshot.false_positive_rate;
        state.cursor = snapshot.cursor;
        state.recorded = snapshot.recorded;
        state.since_checkpoint = 0;
        state.last_checkpoint = Instant::now();

        tracing::info!(
            recorded = state.recorded,
            cursor = ?state.cursor,
            "Restored resume checkpoint"
        );
        Ok(())
    }
}

/// Read a checkpoint from disk; `Ok(None)` when the file does not exist
pub async fn load_snapshot(path: &Path) -> Result<Option<ResumeSnapshot>, PersistError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PersistError::Corrupted {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| PersistError::Corrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
