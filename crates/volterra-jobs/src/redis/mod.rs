//! Redis-backed queue, stores and event bus.

mod events;
mod queue;
mod store;

pub use events::RedisEventBus;
pub use queue::RedisJobQueue;
pub use store::{RedisAnalysisStore, RedisTrajectoryStore};

use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use crate::job::QueueKind;
use deadpool_redis::{Config, Pool, Runtime};
use std::time::Duration;
use tracing::info;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job queue...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {e}")))?
        .max_size(config.pool_size)
        .wait_timeout(Some(Duration::from_secs(config.connect_timeout_secs)))
        .create_timeout(Some(Duration::from_secs(config.connect_timeout_secs)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {e}")))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Ready jobs (sorted set by priority + time).
    pub fn priority_queue(&self, kind: QueueKind) -> String {
        format!("{}:pqueue:{}", self.prefix, kind)
    }

    /// Jobs waiting for their retry time (sorted set by ready time).
    pub fn delayed(&self, kind: QueueKind) -> String {
        format!("{}:delayed:{}", self.prefix, kind)
    }

    /// Claimed jobs (sorted set by claim deadline).
    pub fn active(&self, kind: QueueKind) -> String {
        format!("{}:active:{}", self.prefix, kind)
    }

    /// Non-zero job priorities (hash: job_id -> priority).
    pub fn priorities(&self, kind: QueueKind) -> String {
        format!("{}:priority:{}", self.prefix, kind)
    }

    /// Job envelope JSON.
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Completion marker.
    pub fn done(&self, job_id: &str) -> String {
        format!("{}:done:{}", self.prefix, job_id)
    }

    /// Dead letter queue (sorted set by time).
    pub fn dlq(&self, kind: QueueKind) -> String {
        format!("{}:dlq:{}", self.prefix, kind)
    }

    /// Stats hash.
    pub fn stats(&self, kind: QueueKind) -> String {
        format!("{}:stats:{}", self.prefix, kind)
    }

    /// Analysis aggregate hash.
    pub fn analysis(&self, analysis_id: &str) -> String {
        format!("{}:analysis:{}", self.prefix, analysis_id)
    }

    /// One of the `expected|completed|failed|pending` timestep sets.
    pub fn analysis_frames(&self, analysis_id: &str, set: &str) -> String {
        format!("{}:analysis:{}:{}", self.prefix, analysis_id, set)
    }

    /// In-flight guard for one (analysis, timestep).
    pub fn frame_guard(&self, analysis_id: &str, timestep: u64) -> String {
        format!("{}:analysis:{}:guard:{}", self.prefix, analysis_id, timestep)
    }

    /// Trajectory stats hash (`version`, `data`).
    pub fn trajectory(&self, trajectory_id: &str) -> String {
        format!("{}:trajectory:{}", self.prefix, trajectory_id)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("volterra:jobs")
    }
}
