//! Bounded concurrency scheduler for per-item work
//!
//! Media-bearing items each hold one permit from a semaphore sized to the
//! configured limit; text-only items skip the semaphore. Every Kth permit
//! acquisition samples process memory and backs off when it is above the
//! threshold. Results come back indexed by input position, and only once
//! every item has finished.

mod metrics;

pub use metrics::{MetricsSnapshot, SchedulerMetrics};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result, TransferError};
use crate::resource::ResourceSampler;
use crate::types::{BatchResult, Event, ItemDetail, ItemResult, WorkItem};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// Per-item work run by the scheduler
///
/// Called for every item, media or not. An error fails that item only.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Process one item
    async fn process(&self, item: &WorkItem) -> std::result::Result<ItemDetail, TransferError>;
}

/// Runs batches of work items under a permit budget and memory backpressure
pub struct ConcurrencyScheduler {
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    sampler: Arc<dyn ResourceSampler>,
    metrics: SchedulerMetrics,
    acquisitions: AtomicU64,
    consecutive_throttles: AtomicU32,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl ConcurrencyScheduler {
    /// Create a scheduler with `config.concurrency_limit` permits
    pub fn new(config: &SchedulerConfig, sampler: Arc<dyn ResourceSampler>) -> Self {
        let limit = config.concurrency_limit.max(1);
        tracing::debug!(
            limit,
            parallel = config.parallel,
            sample_interval = config.sample_interval,
            "Created concurrency scheduler"
        );
        Self {
            config: config.clone(),
            permits: Arc::new(Semaphore::new(limit)),
            sampler,
            metrics: SchedulerMetrics::default(),
            acquisitions: AtomicU64::new(0),
            consecutive_throttles: AtomicU32::new(0),
            event_tx: None,
        }
    }

    /// Publish throttle events on the given channel
    #[must_use]
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Configured permit budget
    pub fn concurrency_limit(&self) -> usize {
        self.config.concurrency_limit.max(1)
    }

    /// Permits not currently held
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Current metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero the metrics
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Process one batch and return its results in input order
    ///
    /// Individual failures and panics become `Failed` entries. The batch as
    /// a whole fails only on cancellation or resource exhaustion; in both
    /// cases in-flight work is dropped, its permits are released and no
    /// partial result escapes.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fires before the batch completes
    /// - [`Error::ResourceExhausted`] if memory stays above the threshold
    ///   for more than `max_consecutive_throttles` samples in a row
    pub async fn process_batch(
        &self,
        items: &[WorkItem],
        processor: &dyn ItemProcessor,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let work = async {
            if self.config.parallel {
                let tasks = items.iter().map(|item| self.run_item(item, processor));
                futures::future::try_join_all(tasks).await
            } else {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    results.push(self.run_sequential(item, processor).await);
                }
                Ok(results)
            }
        };

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(items = items.len(), "Batch cancelled, discarding partial results");
                return Err(Error::Cancelled);
            }
            results = work => results?,
        };

        Ok(BatchResult { items: results })
    }

    async fn run_item(&self, item: &WorkItem, processor: &dyn ItemProcessor) -> Result<ItemResult> {
        if !item.has_media() {
            return Ok(self.run_guarded(item, processor).await);
        }

        // Closed only if the scheduler is being torn down
        let _permit = self.permits.acquire().await.map_err(|_| Error::Cancelled)?;
        let _active = self.metrics.transfer_started();
        self.check_memory().await?;
        Ok(self.run_guarded(item, processor).await)
    }

    async fn run_sequential(&self, item: &WorkItem, processor: &dyn ItemProcessor) -> ItemResult {
        if !item.has_media() {
            return self.run_guarded(item, processor).await;
        }
        let _active = self.metrics.transfer_started();
        self.run_guarded(item, processor).await
    }

    async fn run_guarded(&self, item: &WorkItem, processor: &dyn ItemProcessor) -> ItemResult {
        let outcome = AssertUnwindSafe(processor.process(item))
            .catch_unwind()
            .await;
        self.metrics.item_processed();

        match outcome {
            Ok(Ok(detail)) => ItemResult::success(item.sequence_id, detail),
            Ok(Err(e)) => {
                tracing::warn!(
                    sequence_id = %item.sequence_id,
                    error = %e,
                    code = e.error_code(),
                    "Item failed"
                );
                ItemResult::failed(item.sequence_id, e.error_code(), e.to_string())
            }
            Err(payload) => {
                let e = TransferError::Panicked(panic_message(payload.as_ref()));
                tracing::error!(sequence_id = %item.sequence_id, error = %e, "Item task panicked");
                ItemResult::failed(item.sequence_id, e.error_code(), e.to_string())
            }
        }
    }

    /// Sample memory on every Kth acquisition and back off while it is high
    async fn check_memory(&self) -> Result<()> {
        let acquired = self.acquisitions.fetch_add(1, Ordering::AcqRel) + 1;
        if acquired % self.config.sample_interval.max(1) != 0 {
            return Ok(());
        }

        let used_bytes = self.sampler.used_memory_bytes();
        let threshold_bytes = self.config.memory_threshold_bytes;
        if used_bytes <= threshold_bytes {
            self.consecutive_throttles.store(0, Ordering::Release);
            return Ok(());
        }

        self.metrics.throttled();
        if let Some(tx) = &self.event_tx {
            tx.send(Event::Throttled {
                used_bytes,
                threshold_bytes,
            })
            .ok();
        }

        let consecutive = self.consecutive_throttles.fetch_add(1, Ordering::AcqRel) + 1;
        if consecutive > self.config.max_consecutive_throttles {
            // Fresh budget for whoever retries the batch
            self.consecutive_throttles.store(0, Ordering::Release);
            tracing::error!(
                used_bytes,
                threshold_bytes,
                consecutive,
                "Memory stayed above threshold, aborting batch"
            );
            return Err(Error::ResourceExhausted {
                used_bytes,
                threshold_bytes,
            });
        }

        tracing::debug!(
            used_bytes,
            threshold_bytes,
            consecutive,
            backoff_ms = self.config.throttle_backoff.as_millis() as u64,
            "Memory above threshold, backing off"
        );
        tokio::time::sleep(self.config.throttle_backoff).await;
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
