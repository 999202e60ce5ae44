//! Error types for chat-export
//!
//! Errors are split by blast radius:
//! - [`TransferError`] is scoped to one item and always ends up as a `Failed` outcome
//! - [`PersistError`] covers cache and checkpoint snapshots, never fatal on its own
//! - [`Error`] is what a run or a batch returns

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for chat-export operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chat-export
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "scheduler.concurrency_limit")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Single-item transfer error surfaced outside the scheduler
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Snapshot persistence error
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Upstream source could not produce the next batch
    #[error("upstream source error: {0}")]
    Source(String),

    /// Downstream writer rejected a batch; fatal for the run
    #[error("commit failed for batch {batch}: {message}")]
    Commit {
        /// Batch number that failed to commit
        batch: u64,
        /// Writer-provided reason
        message: String,
    },

    /// Memory stayed above the threshold despite repeated backoff
    #[error("resource exhausted: process memory {used_bytes} bytes above threshold {threshold_bytes} bytes")]
    ResourceExhausted {
        /// Last sampled usage in bytes
        used_bytes: u64,
        /// Configured threshold in bytes
        threshold_bytes: u64,
    },

    /// The run or batch was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Per-item transfer errors
///
/// These never abort a batch; the scheduler records them as `Failed`.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network or remote fault while fetching media
    #[error("network error fetching {media_ref}: {reason}")]
    Network {
        /// Remote media reference
        media_ref: String,
        /// What went wrong
        reason: String,
        /// Whether the fault is transient and worth retrying
        transient: bool,
    },

    /// Remote media no longer exists
    #[error("media {media_ref} not found on remote")]
    NotFound {
        /// Remote media reference
        media_ref: String,
    },

    /// Local filesystem fault
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Downloaded bytes did not match the hash the remote reported
    #[error("hash mismatch for {media_ref}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Remote media reference
        media_ref: String,
        /// Hash reported by the remote
        expected: String,
        /// Hash computed locally
        actual: String,
    },

    /// Destination exists and the collision policy forbids overwriting
    #[error("destination {path} already exists")]
    Collision {
        /// Destination path
        path: PathBuf,
    },

    /// Task panicked; captured so siblings keep running
    #[error("transfer task panicked: {0}")]
    Panicked(String),
}

impl TransferError {
    /// Build an I/O error for the given path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            TransferError::Network { .. } => "network_error",
            TransferError::NotFound { .. } => "media_not_found",
            TransferError::Io { .. } => "io_error",
            TransferError::HashMismatch { .. } => "hash_mismatch",
            TransferError::Collision { .. } => "file_collision",
            TransferError::Panicked(_) => "task_panicked",
        }
    }
}

/// Snapshot persistence errors (dedup cache and resume checkpoint)
#[derive(Debug, Error)]
pub enum PersistError {
    /// Writing the snapshot failed
    #[error("failed to write snapshot {path}: {reason}")]
    WriteFailed {
        /// Target path
        path: PathBuf,
        /// Reason
        reason: String,
    },

    /// Snapshot exists but could not be decoded
    #[error("corrupted snapshot {path}: {reason}")]
    Corrupted {
        /// Snapshot path
        path: PathBuf,
        /// Reason
        reason: String,
    },

    /// Snapshot was written by an incompatible format version
    #[error("unsupported snapshot version {found} in {path} (expected {expected})")]
    UnsupportedVersion {
        /// Snapshot path
        path: PathBuf,
        /// Version found on disk
        found: u32,
        /// Version this build writes
        expected: u32,
    },
}

impl Error {
    /// Machine-readable error code
    pub fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Transfer(e) => e.error_code(),
            Error::Persist(e) => match e {
                PersistError::WriteFailed { .. } => "snapshot_write_failed",
                PersistError::Corrupted { .. } => "snapshot_corrupted",
                PersistError::UnsupportedVersion { .. } => "snapshot_unsupported_version",
            },
            Error::Source(_) => "source_error",
            Error::Commit { .. } => "commit_failed",
            Error::ResourceExhausted { .. } => "resource_exhausted",
            Error::Cancelled => "cancelled",
            Error::Other(_) => "internal_error",
        }
    }

    /// Whether the error ends the whole run rather than a single batch
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Error::Commit { .. } | Error::Source(_) | Error::Config { .. }
        )
    }

    /// Build a configuration error for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
