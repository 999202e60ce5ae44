//! Scheduler counters, updated lock-free from every worker

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`SchedulerMetrics`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Items processed (media and text)
    pub total_items: u64,
    /// Most media transfers observed running at once
    pub peak_concurrency: u64,
    /// Mean number of running transfers, sampled whenever one starts
    pub average_concurrency: f64,
    /// Sampling events that found memory above the threshold
    pub throttle_events: u64,
}

/// Live scheduler counters
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    total_items: AtomicU64,
    active: AtomicU64,
    peak: AtomicU64,
    concurrency_sum: AtomicU64,
    concurrency_samples: AtomicU64,
    throttle_events: AtomicU64,
}

/// Marks one transfer as running until dropped
pub(crate) struct ActiveTransfer<'a> {
    metrics: &'a SchedulerMetrics,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SchedulerMetrics {
    /// Copy the current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.concurrency_samples.load(Ordering::Acquire);
        let average_concurrency = if samples == 0 {
            0.0
        } else {
            self.concurrency_sum.load(Ordering::Acquire) as f64 / samples as f64
        };
        MetricsSnapshot {
            total_items: self.total_items.load(Ordering::Acquire),
            peak_concurrency: self.peak.load(Ordering::Acquire),
            average_concurrency,
            throttle_events: self.throttle_events.load(Ordering::Acquire),
        }
    }

    /// Zero every counter; transfers still running keep being tracked
    pub fn reset(&self) {
        self.total_items.store(0, Ordering::Release);
        self.peak
            .store(self.active.load(Ordering::Acquire), Ordering::Release);
        self.concurrency_sum.store(0, Ordering::Release);
        self.concurrency_samples.store(0, Ordering::Release);
        self.throttle_events.store(0, Ordering::Release);
    }

    pub(crate) fn transfer_started(&self) -> ActiveTransfer<'_> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        self.concurrency_sum.fetch_add(now, Ordering::AcqRel);
        self.concurrency_samples.fetch_add(1, Ordering::AcqRel);
        ActiveTransfer { metrics: self }
    }

    pub(crate) fn item_processed(&self) {
        self.total_items.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn throttled(&self) {
        self.throttle_events.fetch_add(1, Ordering::AcqRel);
    }
}
