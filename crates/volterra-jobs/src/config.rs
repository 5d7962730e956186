//! Job system configuration.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Producer retry configuration.
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Job update fan-out configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Trajectory ingestion configuration.
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "volterra:jobs".to_string()
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent jobs per pool.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Job execution timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Claim lifetime in seconds before a job becomes re-claimable.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Interval between expired-claim sweeps in seconds.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_timeout_secs: default_job_timeout(),
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
            recovery_interval_secs: default_recovery_interval(),
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .max(4)
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_visibility_timeout() -> u64 {
    600
}

fn default_recovery_interval() -> u64 {
    30
}

impl WorkerConfig {
    /// Returns job timeout as Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns the claim visibility timeout as Duration.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Returns the recovery sweep interval as Duration.
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default retry policy attached to new envelopes.
    #[serde(default)]
    pub default_retry: RetryConfig,

    /// Lifetime of completion markers in seconds.
    #[serde(default = "default_completion_ttl")]
    pub completion_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryConfig::default(),
            completion_ttl_secs: default_completion_ttl(),
        }
    }
}

impl QueueConfig {
    /// Returns the completion marker lifetime as Duration.
    pub fn completion_ttl(&self) -> Duration {
        Duration::from_secs(self.completion_ttl_secs.max(1))
    }
}

fn default_completion_ttl() -> u64 {
    86400 * 7 // 7 days
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    600_000 // 10 minutes
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryConfig {
    /// Builds the exponential policy described by this config.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
    }
}

/// Producer-side enqueue retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Total enqueue attempts before giving up.
    #[serde(default = "default_producer_attempts")]
    pub max_attempts: u32,

    /// Initial backoff in milliseconds.
    #[serde(default = "default_producer_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum backoff in milliseconds.
    #[serde(default = "default_producer_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_producer_attempts(),
            initial_delay_ms: default_producer_initial_delay(),
            max_delay_ms: default_producer_max_delay(),
        }
    }
}

fn default_producer_attempts() -> u32 {
    5
}

fn default_producer_initial_delay() -> u64 {
    100
}

fn default_producer_max_delay() -> u64 {
    5000
}

impl ProducerConfig {
    /// Backoff policy between enqueue attempts.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts.saturating_sub(1))
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Job update fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Pub/sub channel carrying `{teamId, payload}` envelopes.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Updates buffered per client before it signals readiness.
    #[serde(default = "default_pending_buffer_capacity")]
    pub pending_buffer_capacity: usize,

    /// Capacity of the in-process broadcast channel.
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            pending_buffer_capacity: default_pending_buffer_capacity(),
            local_capacity: default_local_capacity(),
        }
    }
}

fn default_channel() -> String {
    "job_updates".to_string()
}

fn default_pending_buffer_capacity() -> usize {
    1000
}

fn default_local_capacity() -> usize {
    1024
}

/// Trajectory ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Frames per trajectory processing job.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    20
}
