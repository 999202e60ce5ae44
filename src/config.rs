//! Configuration types for chat-export
//!
//! A single [`Config`] value is built once (by whatever loader the host
//! application uses), validated with [`Config::validate`], and passed by
//! reference into each component's constructor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Concurrency scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run media transfers in parallel (default: true)
    ///
    /// When false, items are processed one at a time in order and no
    /// permits are used. Outcomes are identical to parallel mode.
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Maximum concurrent media transfers (default: half the available hardware threads)
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Process memory above which transfers back off (default: 2 GiB)
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_bytes: u64,

    /// Sample memory on every Kth permit acquisition (default: 10)
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,

    /// Sleep applied when a sample exceeds the threshold (default: 1000 ms)
    #[serde(default = "default_throttle_backoff", with = "duration_millis_serde")]
    pub throttle_backoff: Duration,

    /// Consecutive over-threshold samples tolerated before the batch is aborted (default: 30)
    #[serde(default = "default_max_consecutive_throttles")]
    pub max_consecutive_throttles: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            concurrency_limit: default_concurrency_limit(),
            memory_threshold_bytes: default_memory_threshold(),
            sample_interval: default_sample_interval(),
            throttle_backoff: default_throttle_backoff(),
            max_consecutive_throttles: default_max_consecutive_throttles(),
        }
    }
}

/// File collision handling strategy for downloaded media
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCollisionAction {
    /// Append (1), (2), etc. to filename (default)
    #[default]
    Rename,
    /// Overwrite existing file
    Overwrite,
    /// Fail the item, keep existing file
    Skip,
}

/// Dedup cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache snapshot path (default: "./export-cache.json")
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Directory downloaded media is written to (default: "./media")
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    /// Maximum entries across the hash and id maps (default: 100000)
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Timeout for the remote hash query (default: 5 seconds)
    #[serde(default = "default_hash_query_timeout", with = "duration_millis_serde")]
    pub hash_query_timeout: Duration,

    /// What to do when a downloaded file's destination already exists
    #[serde(default)]
    pub file_collision: FileCollisionAction,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            media_dir: default_media_dir(),
            max_size: default_cache_max_size(),
            hash_query_timeout: default_hash_query_timeout(),
            file_collision: FileCollisionAction::default(),
        }
    }
}

/// Resume filter and checkpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Checkpoint snapshot path (default: "./export-checkpoint.json")
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// Number of items the filter is sized for (default: 1000000)
    #[serde(default = "default_expected_items")]
    pub expected_items: u64,

    /// Target false-positive rate at `expected_items` (default: 0.01)
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,

    /// Checkpoint after this many committed items (default: 1000)
    #[serde(default = "default_checkpoint_every_items")]
    pub checkpoint_every_items: u64,

    /// Checkpoint at least this often while items are committed (default: 30 seconds)
    #[serde(default = "default_checkpoint_interval", with = "duration_serde")]
    pub checkpoint_interval: Duration,

    /// Ignore the checkpoint cursor and pull from the start, skipping via the filter (default: false)
    #[serde(default)]
    pub rescan_from_start: bool,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            expected_items: default_expected_items(),
            false_positive_rate: default_false_positive_rate(),
            checkpoint_every_items: default_checkpoint_every_items(),
            checkpoint_interval: default_checkpoint_interval(),
            rescan_from_start: false,
        }
    }
}

/// Orchestrator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Times a batch aborted for resource exhaustion is retried before the run ends (default: 2)
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,

    /// Pause before retrying an aborted batch (default: 5000 ms)
    #[serde(default = "default_batch_retry_delay", with = "duration_millis_serde")]
    pub batch_retry_delay: Duration,

    /// Capacity of the event broadcast channel (default: 1024)
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_retries: default_max_batch_retries(),
            batch_retry_delay: default_batch_retry_delay(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "duration_millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for an export run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transfer scheduling and memory backpressure
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Dedup cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Resume filter and checkpointing
    #[serde(default)]
    pub resume: ResumeConfig,

    /// Batch orchestration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry policy for media transfers and upstream pulls
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Reject values that would make a component misbehave
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.concurrency_limit == 0 {
            return Err(Error::config(
                "scheduler.concurrency_limit",
                "concurrency limit must be at least 1",
            ));
        }
        if self.scheduler.sample_interval == 0 {
            return Err(Error::config(
                "scheduler.sample_interval",
                "sampling interval must be at least 1",
            ));
        }
        if self.cache.max_size == 0 {
            return Err(Error::config(
                "cache.max_size",
                "cache capacity must be at least 1",
            ));
        }
        let fp = self.resume.false_positive_rate;
        if !(fp > 0.0 && fp < 1.0) {
            return Err(Error::config(
                "resume.false_positive_rate",
                format!("false-positive rate must be in (0, 1), got {fp}"),
            ));
        }
        if self.resume.expected_items == 0 {
            return Err(Error::config(
                "resume.expected_items",
                "expected item count must be at least 1",
            ));
        }
        if self.resume.checkpoint_every_items == 0 {
            return Err(Error::config(
                "resume.checkpoint_every_items",
                "checkpoint item interval must be at least 1",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "backoff multiplier must be >= 1.0",
            ));
        }
        if self.pipeline.event_channel_capacity == 0 {
            return Err(Error::config(
                "pipeline.event_channel_capacity",
                "event channel capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

fn default_memory_threshold() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_sample_interval() -> u64 {
    10
}

fn default_throttle_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_consecutive_throttles() -> u32 {
    30
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./export-cache.json")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("./media")
}

fn default_cache_max_size() -> usize {
    100_000
}

fn default_hash_query_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./export-checkpoint.json")
}

fn default_expected_items() -> u64 {
    1_000_000
}

fn default_false_positive_rate() -> f64 {
    0.01
}

fn default_checkpoint_every_items() -> u64 {
    1000
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_batch_retries() -> u32 {
    2
}

fn default_batch_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
