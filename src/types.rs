//! Core types and events

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ordered key of a work item within the exported history
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub u64);

impl SequenceId {
    /// Create a new SequenceId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Stable byte encoding used when probing the resume filter
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl From<u64> for SequenceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<SequenceId> for u64 {
    fn from(id: SequenceId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SequenceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Opaque handle identifying a media object on the remote source
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub String);

impl MediaRef {
    /// Create a new MediaRef
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the remote identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MediaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position in the upstream sequence, as understood by the upstream source
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    /// Create a new cursor
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One ordered unit of export work, optionally carrying a media reference
///
/// Immutable once produced by the upstream source. Ordering is defined by
/// `sequence_id` ascending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Ordered key
    pub sequence_id: SequenceId,
    /// Attached media, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<MediaRef>,
    /// Expected media size in bytes (0 when unknown or no media)
    #[serde(default)]
    pub size_hint: u64,
}

impl WorkItem {
    /// A text-only item
    pub fn text(sequence_id: u64) -> Self {
        Self {
            sequence_id: SequenceId(sequence_id),
            media_ref: None,
            size_hint: 0,
        }
    }

    /// An item carrying a media reference
    pub fn with_media(sequence_id: u64, media_ref: impl Into<String>, size_hint: u64) -> Self {
        Self {
            sequence_id: SequenceId(sequence_id),
            media_ref: Some(MediaRef::new(media_ref)),
            size_hint,
        }
    }

    /// Whether this item needs a transfer permit
    pub fn has_media(&self) -> bool {
        self.media_ref.is_some()
    }
}

/// Media metadata, populated progressively as resolution proceeds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaDescriptor {
    /// Remote handle (always known)
    pub remote_ref: MediaRef,
    /// Content hash, once queried or computed
    pub content_hash: Option<String>,
    /// Local copy, once resolved or transferred
    pub local_path: Option<PathBuf>,
    /// Size in bytes
    pub byte_size: u64,
}

impl MediaDescriptor {
    /// Descriptor for a freshly seen remote reference
    pub fn new(remote_ref: MediaRef, byte_size: u64) -> Self {
        Self {
            remote_ref,
            content_hash: None,
            local_path: None,
            byte_size,
        }
    }
}

/// Which dedup tier produced a resolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    /// Content hash matched a cached copy
    Hash,
    /// Remote identifier matched a cached copy
    Id,
    /// Full transfer performed
    Downloaded,
}

impl std::fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResolutionTier::Hash => "hash",
            ResolutionTier::Id => "id",
            ResolutionTier::Downloaded => "downloaded",
        };
        f.write_str(name)
    }
}

/// Outcome of processing a single work item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Item processed; media (if any) is available locally
    Success,
    /// Item was not processed (already seen or deliberately skipped)
    Skipped,
    /// Item failed; the failure is isolated to this item
    Failed,
}

/// What happened to one item's media
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDetail {
    /// Item carried no media
    NoMedia,
    /// Media resolved to a local file
    Media {
        /// Local copy of the media
        local_path: PathBuf,
        /// Tier that produced the resolution
        tier: ResolutionTier,
        /// Bytes transferred for this item (0 for cache hits)
        bytes_transferred: u64,
    },
    /// Skipped because the resume filter reported it as already committed
    AlreadySeen,
    /// Processing failed
    Error {
        /// Machine-readable error code
        code: String,
        /// Human-readable error message
        message: String,
    },
}

/// Result of processing one item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Item key
    pub sequence_id: SequenceId,
    /// Outcome
    pub outcome: Outcome,
    /// Outcome detail
    pub detail: ItemDetail,
}

impl ItemResult {
    /// Successful result
    pub fn success(sequence_id: SequenceId, detail: ItemDetail) -> Self {
        Self {
            sequence_id,
            outcome: Outcome::Success,
            detail,
        }
    }

    /// Skipped because already seen
    pub fn skipped(sequence_id: SequenceId) -> Self {
        Self {
            sequence_id,
            outcome: Outcome::Skipped,
            detail: ItemDetail::AlreadySeen,
        }
    }

    /// Failed result
    pub fn failed(sequence_id: SequenceId, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sequence_id,
            outcome: Outcome::Failed,
            detail: ItemDetail::Error {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

/// Ordered per-item results for one batch
///
/// Same length and order as the batch that produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Per-item results in input order
    pub items: Vec<ItemResult>,
}

impl BatchResult {
    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no entries
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Count entries with the given outcome
    pub fn count(&self, outcome: Outcome) -> usize {
        self.items.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Ids of every entry that was committed (i.e. not skipped)
    pub fn committed_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.items
            .iter()
            .filter(|r| r.outcome != Outcome::Skipped)
            .map(|r| r.sequence_id)
    }
}

/// Pipeline stage, used to tag timing events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Pulling a batch from upstream
    Fetch,
    /// Filtering against the resume filter
    Filter,
    /// Running the scheduler over the batch
    Transfer,
    /// Committing to the downstream writer
    Commit,
    /// Writing the resume checkpoint
    Checkpoint,
}

/// Event emitted while an export runs
///
/// Events are published on a broadcast channel; the core never aggregates them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A batch was pulled from upstream
    BatchStarted {
        /// Batch number within this run (0-based)
        batch: u64,
        /// Items in the batch before filtering
        items: usize,
    },

    /// Items were skipped because the resume filter has seen them
    ItemsSkipped {
        /// Batch number
        batch: u64,
        /// Number of skipped items
        count: usize,
    },

    /// A media item was resolved
    MediaResolved {
        /// Item key
        sequence_id: SequenceId,
        /// Tier that resolved it
        tier: ResolutionTier,
        /// Bytes transferred (0 for cache hits)
        bytes: u64,
    },

    /// Hash tier could not be used for an item and fell through
    HashQueryFallback {
        /// Remote media reference
        media_ref: MediaRef,
        /// Why the hash tier was skipped
        reason: String,
    },

    /// A sampled memory reading exceeded the threshold
    Throttled {
        /// Sampled process memory in bytes
        used_bytes: u64,
        /// Configured threshold in bytes
        threshold_bytes: u64,
    },

    /// Time spent in one stage of a batch
    StageTiming {
        /// Batch number
        batch: u64,
        /// Stage
        stage: Stage,
        /// Elapsed milliseconds
        elapsed_ms: u64,
    },

    /// A batch was committed downstream
    BatchCommitted {
        /// Batch number
        batch: u64,
        /// Items with Success outcome
        succeeded: usize,
        /// Items with Failed outcome
        failed: usize,
        /// Items with Skipped outcome
        skipped: usize,
    },

    /// A batch was aborted; nothing from it was committed
    BatchAborted {
        /// Batch number
        batch: u64,
        /// Reason for the abort
        reason: String,
    },

    /// Resume checkpoint persisted
    CheckpointSaved {
        /// Cursor recorded in the checkpoint
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<Cursor>,
        /// Items recorded in the filter so far
        recorded: u64,
    },

    /// Resume checkpoint could not be persisted; the run continues in memory
    CheckpointFailed {
        /// Error message
        error: String,
    },

    /// The run finished
    RunComplete {
        /// Batches committed
        batches: u64,
        /// Items committed (excluding skipped)
        committed: u64,
    },
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn sequence_id_parses_and_displays() {
        let id = SequenceId::from_str("42").unwrap();
        assert_eq!(id, SequenceId(42));
        assert_eq!(id.to_string(), "42");
        assert!(SequenceId::from_str("abc").is_err());
    }

    #[test]
    fn sequence_id_bytes_are_little_endian() {
        assert_eq!(SequenceId(1).to_bytes(), [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn committed_ids_excludes_skipped_entries() {
        let batch = BatchResult {
            items: vec![
                ItemResult::success(SequenceId(1), ItemDetail::NoMedia),
                ItemResult::skipped(SequenceId(2)),
                ItemResult::failed(SequenceId(3), "io_error", "disk gone"),
            ],
        };

        let ids: Vec<_> = batch.committed_ids().collect();
        assert_eq!(ids, vec![SequenceId(1), SequenceId(3)]);
        assert_eq!(batch.count(Outcome::Skipped), 1);
        assert_eq!(batch.count(Outcome::Failed), 1);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::BatchCommitted {
            batch: 3,
            succeeded: 8,
            failed: 1,
            skipped: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "batch_committed");
        assert_eq!(json["succeeded"], 8);
    }

    #[test]
    fn checkpoint_event_omits_missing_cursor() {
        let json = serde_json::to_value(Event::CheckpointSaved {
            cursor: None,
            recorded: 10,
        })
        .unwrap();
        assert!(json.get("cursor").is_none());
    }

    #[test]
    fn work_item_without_media_round_trips_compactly() {
        let item = WorkItem::text(7);
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("media_ref"));
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
        assert!(!back.has_media());
    }
}
