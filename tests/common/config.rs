//! Test configuration helpers: fast retries, scratch paths, no memory pressure

use chat_export::Config;
use std::time::Duration;
use tempfile::TempDir;

/// Configuration rooted in `dir` with millisecond retry and backoff delays
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();

    config.cache.path = dir.path().join("export-cache.json");
    config.cache.media_dir = dir.path().join("media");
    config.cache.hash_query_timeout = Duration::from_millis(100);

    config.resume.path = dir.path().join("export-checkpoint.json");
    config.resume.expected_items = 10_000;
    config.resume.checkpoint_every_items = 100;
    config.resume.checkpoint_interval = Duration::from_secs(3600);

    config.scheduler.concurrency_limit = 4;
    config.scheduler.memory_threshold_bytes = u64::MAX;
    config.scheduler.sample_interval = 1;
    config.scheduler.throttle_backoff = Duration::from_millis(1);

    config.pipeline.batch_retry_delay = Duration::from_millis(1);

    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.jitter = false;

    config
}
