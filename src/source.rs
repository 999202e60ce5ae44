//! Collaborator interfaces the export core drives but does not own
//!
//! - [`UpstreamSource`] yields ordered pages of work items
//! - [`HashQuery`] optionally reports a remote content hash
//! - [`MediaFetcher`] performs the actual transfer of one media object
//! - [`DownstreamWriter`] receives each completed batch exactly once

use crate::error::TransferError;
use crate::types::{BatchResult, Cursor, MediaRef, WorkItem};
use async_trait::async_trait;
use std::path::Path;

/// One page pulled from upstream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Page {
    /// Items in ascending `sequence_id` order
    pub items: Vec<WorkItem>,
    /// Cursor for the following page; `None` when the sequence is exhausted
    pub next_cursor: Option<Cursor>,
}

impl Page {
    /// Final page with the given items
    pub fn last(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Pull-based, resumable, ordered source of work items
///
/// The core treats the source as read-only; reconnection and authentication
/// are the implementation's business.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetch the page starting at `cursor` (`None` means the beginning)
    ///
    /// # Errors
    ///
    /// Errors classified retryable by [`IsRetryable`](crate::retry::IsRetryable)
    /// are retried; anything else ends the run.
    async fn next_batch(&self, cursor: Option<&Cursor>) -> crate::Result<Page>;
}

/// Answer from a remote hash query
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HashLookup {
    /// Remote reported this content hash (lowercase hex SHA-256)
    Found(String),
    /// Remote cannot answer for this item
    Unavailable(String),
}

/// Optional remote capability returning a content hash without transferring
/// the media
///
/// Timeouts are applied by the caller.
#[async_trait]
pub trait HashQuery: Send + Sync {
    /// Ask the remote for the content hash of `media_ref`
    async fn query_hash(&self, media_ref: &MediaRef) -> HashLookup;
}

/// What a completed fetch reports back
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchedMedia {
    /// Bytes written to the destination
    pub bytes: u64,
    /// Content hash if the remote supplied one; computed locally otherwise
    pub content_hash: Option<String>,
}

/// Transfers one media object to a local path
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download `media_ref` into `dest`, replacing anything already there
    ///
    /// `dest` is a private staging file; it is moved to its final name only
    /// after the transfer succeeds and verifies.
    async fn fetch(&self, media_ref: &MediaRef, dest: &Path) -> Result<FetchedMedia, TransferError>;
}

/// Receives committed batches, in order, exactly once each
#[async_trait]
pub trait DownstreamWriter: Send + Sync {
    /// Persist one complete batch
    ///
    /// # Errors
    ///
    /// Any error is fatal for the run.
    async fn commit(&self, batch: &BatchResult) -> crate::Result<()>;
}
