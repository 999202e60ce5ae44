//! Per-item processor: resolve media through the dedup cache

use crate::dedup::DedupCache;
use crate::error::TransferError;
use crate::scheduler::ItemProcessor;
use crate::types::{Event, ItemDetail, MediaDescriptor, WorkItem};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Resolves each media-bearing item to a local file
///
/// Text-only items pass straight through as [`ItemDetail::NoMedia`]. The
/// cache entries backing a resolution stay pinned until `process` returns.
pub struct MediaProcessor {
    cache: Arc<DedupCache>,
    event_tx: broadcast::Sender<Event>,
}

impl MediaProcessor {
    /// Processor resolving through `cache`
    pub fn new(cache: Arc<DedupCache>, event_tx: broadcast::Sender<Event>) -> Self {
        Self { cache, event_tx }
    }
}

#[async_trait]
impl ItemProcessor for MediaProcessor {
    async fn process(&self, item: &WorkItem) -> Result<ItemDetail, TransferError> {
        let Some(media_ref) = &item.media_ref else {
            return Ok(ItemDetail::NoMedia);
        };

        let mut descriptor = MediaDescriptor::new(media_ref.clone(), item.size_hint);
        let resolved = self.cache.resolve(&mut descriptor).await?;

        self.event_tx
            .send(Event::MediaResolved {
                sequence_id: item.sequence_id,
                tier: resolved.tier,
                bytes: resolved.bytes_transferred,
            })
            .ok();

        Ok(ItemDetail::Media {
            local_path: resolved.local_path.clone(),
            tier: resolved.tier,
            bytes_transferred: resolved.bytes_transferred,
        })
    }
}
