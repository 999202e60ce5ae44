//! Export run driver
//!
//! Pulls ordered pages from the upstream source, drops items the resume
//! filter has already seen, runs the rest through the scheduler, and commits
//! each complete batch to the downstream writer before pulling the next.
//!
//! - [`media`] - the per-item processor resolving media via the dedup cache

mod media;

pub use media::MediaProcessor;

use crate::config::Config;
use crate::dedup::DedupCache;
use crate::error::{Error, Result};
use crate::resource::{ProcessMemorySampler, ResourceSampler};
use crate::resume::ResumeFilter;
use crate::retry::with_retry;
use crate::scheduler::{ConcurrencyScheduler, ItemProcessor};
use crate::source::{DownstreamWriter, HashQuery, MediaFetcher, Page, UpstreamSource};
use crate::types::{
    BatchResult, Cursor, Event, ItemDetail, ItemResult, Outcome, ResolutionTier, Stage, WorkItem,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// External collaborators of one export run
pub struct Collaborators {
    /// Ordered source of work items
    pub source: Arc<dyn UpstreamSource>,
    /// Performs media transfers
    pub fetcher: Arc<dyn MediaFetcher>,
    /// Receives committed batches
    pub writer: Arc<dyn DownstreamWriter>,
    /// Optional remote hash lookup for the first dedup tier
    pub hash_query: Option<Arc<dyn HashQuery>>,
    /// Process memory reader for backpressure
    pub sampler: Arc<dyn ResourceSampler>,
}

impl Collaborators {
    /// Collaborators with no hash query and the real process memory sampler
    pub fn new(
        source: Arc<dyn UpstreamSource>,
        fetcher: Arc<dyn MediaFetcher>,
        writer: Arc<dyn DownstreamWriter>,
    ) -> Self {
        Self {
            source,
            fetcher,
            writer,
            hash_query: None,
            sampler: Arc::new(ProcessMemorySampler::new()),
        }
    }

    /// Enable the hash tier
    #[must_use]
    pub fn with_hash_query(mut self, query: Arc<dyn HashQuery>) -> Self {
        self.hash_query = Some(query);
        self
    }

    /// Replace the memory sampler
    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }
}

/// Totals for one run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Batches committed
    pub batches: u64,
    /// Items committed (everything not skipped)
    pub committed: u64,
    /// Items with a Success outcome
    pub succeeded: u64,
    /// Items with a Failed outcome
    pub failed: u64,
    /// Items skipped by the resume filter
    pub skipped: u64,
    /// Media resolved from the hash or id tier
    pub cache_hits: u64,
    /// Media transferred in full
    pub downloads: u64,
    /// Memory samples that found usage above the threshold
    pub throttle_events: u64,
    /// Most transfers observed running at once
    pub peak_concurrency: u64,
}

impl RunSummary {
    fn add_batch(&mut self, batch: &BatchResult) {
        self.batches += 1;
        for item in &batch.items {
            match item.outcome {
                Outcome::Success => self.succeeded += 1,
                Outcome::Failed => self.failed += 1,
                Outcome::Skipped => self.skipped += 1,
            }
            if item.outcome != Outcome::Skipped {
                self.committed += 1;
            }
            if let ItemDetail::Media { tier, .. } = &item.detail {
                match tier {
                    ResolutionTier::Hash | ResolutionTier::Id => self.cache_hits += 1,
                    ResolutionTier::Downloaded => self.downloads += 1,
                }
            }
        }
    }
}

/// Drives one export run end to end
///
/// Every component is built here and owned for the life of the run; nothing
/// is shared through globals.
pub struct PipelineOrchestrator {
    config: Config,
    source: Arc<dyn UpstreamSource>,
    writer: Arc<dyn DownstreamWriter>,
    cache: Arc<DedupCache>,
    resume: Arc<ResumeFilter>,
    scheduler: ConcurrencyScheduler,
    processor: Arc<dyn ItemProcessor>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl PipelineOrchestrator {
    /// Validate the configuration, load persisted state and wire the components
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid. Missing or
    /// corrupted cache and checkpoint files are not errors.
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (event_tx, _rx) = broadcast::channel(config.pipeline.event_channel_capacity);

        let mut cache =
            DedupCache::open(&config, collaborators.fetcher, event_tx.clone()).await;
        if let Some(query) = collaborators.hash_query {
            cache = cache.with_hash_query(query);
        }
        let cache = Arc::new(cache);

        let resume = Arc::new(ResumeFilter::open(&config.resume).await);
        let scheduler = ConcurrencyScheduler::new(&config.scheduler, collaborators.sampler)
            .with_events(event_tx.clone());
        let processor: Arc<dyn ItemProcessor> =
            Arc::new(MediaProcessor::new(Arc::clone(&cache), event_tx.clone()));

        Ok(Self {
            config,
            source: collaborators.source,
            writer: collaborators.writer,
            cache,
            resume,
            scheduler,
            processor,
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that aborts the run when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort the run; the in-progress batch is discarded
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Shared dedup cache
    pub fn cache(&self) -> &Arc<DedupCache> {
        &self.cache
    }

    /// Shared resume filter
    pub fn resume(&self) -> &Arc<ResumeFilter> {
        &self.resume
    }

    /// Scheduler driving each batch
    pub fn scheduler(&self) -> &ConcurrencyScheduler {
        &self.scheduler
    }

    /// Run until the upstream source is exhausted
    ///
    /// Batches are committed strictly in order and the next batch is not
    /// pulled until the current one is committed.
    ///
    /// # Errors
    ///
    /// - [`Error::Commit`] when the writer rejects a batch
    /// - [`Error::Source`] when the upstream cannot be read after retries
    /// - [`Error::ResourceExhausted`] when a batch keeps aborting on memory pressure
    /// - [`Error::Cancelled`] when the run is cancelled
    ///
    /// In every case the committed prefix and its checkpoint stay valid for
    /// a later resume.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut cursor = if self.config.resume.rescan_from_start {
            None
        } else {
            self.resume.cursor()
        };
        tracing::info!(
            cursor = ?cursor,
            recorded = self.resume.recorded(),
            parallel = self.config.scheduler.parallel,
            concurrency_limit = self.scheduler.concurrency_limit(),
            "Starting export run"
        );

        let mut batch = 0u64;
        loop {
            match self.run_batch(batch, cursor.as_ref(), &mut summary).await {
                Ok(next) => cursor = next,
                Err(e) => {
                    self.checkpoint(batch).await;
                    self.fill_metrics(&mut summary);
                    if matches!(e, Error::Cancelled) {
                        tracing::info!(batch, committed = summary.committed, "Export run cancelled");
                    } else {
                        tracing::error!(batch, error = %e, code = e.error_code(), "Export run failed");
                    }
                    return Err(e);
                }
            }
            batch += 1;
            if cursor.is_none() {
                break;
            }
        }

        self.checkpoint(batch).await;
        self.fill_metrics(&mut summary);
        tracing::info!(
            batches = summary.batches,
            committed = summary.committed,
            failed = summary.failed,
            skipped = summary.skipped,
            downloads = summary.downloads,
            cache_hits = summary.cache_hits,
            "Export run complete"
        );
        self.emit(Event::RunComplete {
            batches: summary.batches,
            committed: summary.committed,
        });
        Ok(summary)
    }

    /// Pull, filter, transfer and commit one batch; returns the next cursor
    async fn run_batch(
        &self,
        batch: u64,
        cursor: Option<&Cursor>,
        summary: &mut RunSummary,
    ) -> Result<Option<Cursor>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let started = Instant::now();
        let page = self.pull(cursor).await?;
        self.stage_timing(batch, Stage::Fetch, started);

        if page.items.is_empty() {
            tracing::debug!(batch, "Upstream returned an empty page");
            self.advance_cursor(cursor, &page);
            return Ok(page.next_cursor);
        }
        self.emit(Event::BatchStarted {
            batch,
            items: page.items.len(),
        });

        let started = Instant::now();
        let seen: Vec<bool> = page
            .items
            .iter()
            .map(|item| self.resume.seen(item.sequence_id))
            .collect();
        let pending: Vec<WorkItem> = page
            .items
            .iter()
            .zip(&seen)
            .filter(|(_, seen)| !**seen)
            .map(|(item, _)| item.clone())
            .collect();
        let skipped = page.items.len() - pending.len();
        if skipped > 0 {
            tracing::debug!(batch, skipped, "Skipping items already committed");
            self.emit(Event::ItemsSkipped {
                batch,
                count: skipped,
            });
        }
        self.stage_timing(batch, Stage::Filter, started);

        let started = Instant::now();
        let processed = self.transfer(batch, &pending).await?;
        self.stage_timing(batch, Stage::Transfer, started);

        let result = merge_skipped(&page.items, &seen, processed)?;

        let started = Instant::now();
        if let Err(e) = self.writer.commit(&result).await {
            return Err(Error::Commit {
                batch,
                message: e.to_string(),
            });
        }
        self.stage_timing(batch, Stage::Commit, started);

        // Failed items were committed too; re-running them would duplicate output
        self.resume.record_all(result.committed_ids());
        self.advance_cursor(cursor, &page);
        summary.add_batch(&result);

        let succeeded = result.count(Outcome::Success);
        let failed = result.count(Outcome::Failed);
        tracing::info!(batch, succeeded, failed, skipped, "Batch committed");
        self.emit(Event::BatchCommitted {
            batch,
            succeeded,
            failed,
            skipped,
        });

        if self.resume.checkpoint_due() {
            self.checkpoint(batch).await;
        }
        Ok(page.next_cursor)
    }

    /// Record where the next run should start
    ///
    /// On the final page the cursor stays at that page, so a later run picks
    /// up anything appended after it.
    fn advance_cursor(&self, current: Option<&Cursor>, page: &Page) {
        let next = page.next_cursor.clone().or_else(|| current.cloned());
        self.resume.set_cursor(next);
    }

    async fn pull(&self, cursor: Option<&Cursor>) -> Result<Page> {
        let pull = with_retry(&self.config.retry, || self.source.next_batch(cursor));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            page = pull => page.map_err(|e| match e {
                Error::Source(_) => e,
                other => Error::Source(other.to_string()),
            }),
        }
    }

    /// Run the scheduler, retrying the whole batch after resource exhaustion
    async fn transfer(&self, batch: u64, items: &[WorkItem]) -> Result<BatchResult> {
        let max_retries = self.config.pipeline.max_batch_retries;
        let mut attempt = 0u32;
        loop {
            let result = self
                .scheduler
                .process_batch(items, self.processor.as_ref(), &self.cancel)
                .await;
            match result {
                Ok(result) => return Ok(result),
                Err(e @ Error::ResourceExhausted { .. }) => {
                    self.emit(Event::BatchAborted {
                        batch,
                        reason: e.to_string(),
                    });
                    if attempt >= max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::warn!(
                        batch,
                        attempt,
                        max_retries,
                        error = %e,
                        "Batch aborted under memory pressure, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(self.config.pipeline.batch_retry_delay) => {}
                    }
                }
                Err(e) => {
                    self.emit(Event::BatchAborted {
                        batch,
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
    }

    /// Persist the cache and the resume checkpoint; failures are logged only
    async fn checkpoint(&self, batch: u64) {
        let started = Instant::now();

        if let Err(e) = self.cache.persist().await {
            tracing::warn!(error = %e, "Failed to persist dedup cache");
        }

        match self.resume.checkpoint().await {
            Ok(snapshot) => {
                tracing::debug!(
                    cursor = ?snapshot.cursor,
                    recorded = snapshot.recorded,
                    "Checkpoint saved"
                );
                self.emit(Event::CheckpointSaved {
                    cursor: snapshot.cursor,
                    recorded: snapshot.recorded,
                });
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Checkpoint failed, continuing with in-memory resume state"
                );
                self.emit(Event::CheckpointFailed {
                    error: e.to_string(),
                });
            }
        }

        self.stage_timing(batch, Stage::Checkpoint, started);
    }

    fn fill_metrics(&self, summary: &mut RunSummary) {
        let metrics = self.scheduler.metrics();
        summary.throttle_events = metrics.throttle_events;
        summary.peak_concurrency = metrics.peak_concurrency;
    }

    fn stage_timing(&self, batch: u64, stage: Stage, started: Instant) {
        self.emit(Event::StageTiming {
            batch,
            stage,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}

/// Put skipped entries back at their original positions
fn merge_skipped(items: &[WorkItem], seen: &[bool], processed: BatchResult) -> Result<BatchResult> {
    let mut processed = processed.items.into_iter();
    let mut merged = Vec::with_capacity(items.len());
    for (item, seen) in items.iter().zip(seen) {
        if *seen {
            merged.push(ItemResult::skipped(item.sequence_id));
            continue;
        }
        match processed.next() {
            Some(result) if result.sequence_id == item.sequence_id => merged.push(result),
            Some(result) => {
                return Err(Error::Other(format!(
                    "scheduler returned {} where {} was expected",
                    result.sequence_id, item.sequence_id
                )));
            }
            None => {
                return Err(Error::Other(format!(
                    "scheduler returned no result for {}",
                    item.sequence_id
                )));
            }
        }
    }
    Ok(BatchResult { items: merged })
}
