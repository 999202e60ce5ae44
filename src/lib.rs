//! # chat-export
//!
//! Core engine for exporting large ordered message histories with media.
//!
//! An export run pulls ordered batches of work items from an upstream
//! source, skips what an earlier run already committed, resolves attached
//! media through a three-tier dedup cache under bounded concurrency, and
//! commits every batch, in order and in full, to a downstream writer.
//!
//! ## Components
//!
//! - [`scheduler::ConcurrencyScheduler`] - permit-gated worker pool with memory backpressure
//! - [`dedup::DedupCache`] - hash, id and download tiers over a bounded persistent cache
//! - [`resume::ResumeFilter`] - bloom filter plus cursor, checkpointed for restart
//! - [`pipeline::PipelineOrchestrator`] - drives the run
//!
//! ## Quick Start
//!
//! ```no_run
//! use chat_export::{Collaborators, Config, PipelineOrchestrator};
//! # use std::sync::Arc;
//! # async fn example(
//! #     source: Arc<dyn chat_export::UpstreamSource>,
//! #     fetcher: Arc<dyn chat_export::MediaFetcher>,
//! #     writer: Arc<dyn chat_export::DownstreamWriter>,
//! # ) -> chat_export::Result<()> {
//! let orchestrator =
//!     PipelineOrchestrator::new(Config::default(), Collaborators::new(source, fetcher, writer))
//!         .await?;
//!
//! let mut events = orchestrator.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! let summary = chat_export::run_with_shutdown(&orchestrator).await?;
//! println!("committed {} items", summary.committed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Media deduplication cache
pub mod dedup;
/// Error types
pub mod error;
/// Export run orchestration
pub mod pipeline;
/// Process memory sampling
pub mod resource;
/// Resume filter and checkpoints
pub mod resume;
/// Retry logic with exponential backoff
pub mod retry;
/// Bounded concurrency scheduler
pub mod scheduler;
/// Collaborator interfaces
pub mod source;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, FileCollisionAction};
pub use dedup::{DedupCache, ResolvedMedia};
pub use error::{Error, PersistError, Result, TransferError};
pub use pipeline::{Collaborators, PipelineOrchestrator, RunSummary};
pub use resource::{ProcessMemorySampler, ResourceSampler};
pub use resume::ResumeFilter;
pub use scheduler::{ConcurrencyScheduler, ItemProcessor, MetricsSnapshot};
pub use source::{DownstreamWriter, FetchedMedia, HashLookup, HashQuery, MediaFetcher, Page, UpstreamSource};
pub use types::{
    BatchResult, Cursor, Event, ItemDetail, ItemResult, MediaDescriptor, MediaRef, Outcome,
    ResolutionTier, SequenceId, Stage, WorkItem,
};

/// Run an export with graceful signal handling
///
/// A termination signal cancels the run: the batch in progress is discarded,
/// committed state is checkpointed, and [`Error::Cancelled`] is returned.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(orchestrator: &PipelineOrchestrator) -> Result<RunSummary> {
    let run = orchestrator.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result,
        () = wait_for_signal() => {
            tracing::info!("Shutdown requested, aborting export run");
            orchestrator.cancel();
        }
    }

    run.await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            if tokio::signal::ctrl_c().await.is_err() {
                // Never cancel a run because signal handling is unavailable
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C signal");
}
