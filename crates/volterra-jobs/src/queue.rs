//! Job queue abstraction.
//!
//! Delivery is at-least-once: `dequeue` claims a job until a deadline, and a
//! claim that is neither completed nor failed by then is handed back to the
//! ready queue by `recover_expired`. Completion writes a marker that lets
//! workers recognise redelivered jobs.

use crate::error::{JobError, JobResult};
use crate::job::{JobEnvelope, JobId, QueueKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled for another attempt.
    Retried { retry_at: DateTime<Utc> },
    /// Attempts exhausted or error not retryable.
    DeadLettered,
}

/// Job queue trait for different backends.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job; it becomes ready at its `scheduled_at`.
    async fn enqueue(&self, envelope: JobEnvelope) -> JobResult<JobId>;

    /// Claim the highest-priority ready job of `kind` for `visibility`.
    async fn dequeue(
        &self,
        kind: QueueKind,
        worker_id: &str,
        visibility: Duration,
    ) -> JobResult<Option<JobEnvelope>>;

    /// Write the completion marker and release the claim.
    async fn complete(&self, job_id: &JobId) -> JobResult<()>;

    /// Release the claim after a failed attempt.
    async fn fail(&self, job_id: &JobId, error: &JobError) -> JobResult<FailOutcome>;

    /// Returns true if the completion marker exists.
    async fn is_completed(&self, job_id: &JobId) -> JobResult<bool>;

    /// Return claims past their deadline to the ready queue.
    async fn recover_expired(&self, kind: QueueKind) -> JobResult<u64>;

    /// Ready jobs waiting in the queue.
    async fn queue_length(&self, kind: QueueKind) -> JobResult<u64>;

    /// Queue statistics.
    async fn stats(&self, kind: QueueKind) -> JobResult<QueueStats>;

    /// Health check.
    async fn health_check(&self) -> JobResult<()>;
}

/// Decides between retry and dead-lettering for a failed attempt.
pub(crate) fn fail_decision(envelope: &JobEnvelope, error: &JobError) -> FailOutcome {
    if error.is_retryable()
        && envelope.attempt < envelope.max_attempts
        && envelope.retry_policy.should_retry(envelope.attempt)
    {
        FailOutcome::Retried {
            retry_at: envelope.retry_policy.retry_at(envelope.attempt),
        }
    } else {
        FailOutcome::DeadLettered
    }
}

/// Priority score for ordered sets: higher priority first, then older.
pub(crate) fn priority_score(priority: i8, ready_at_ms: i64) -> f64 {
    -(f64::from(priority)) * 1_000_000_000_000.0 + ready_at_ms as f64
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,

    /// Ready jobs.
    pub pending: u64,

    /// Claimed jobs.
    pub active: u64,

    /// Jobs waiting for their retry time.
    pub delayed: u64,

    /// Jobs completed.
    pub completed: u64,

    /// Attempts that were rescheduled.
    pub retried: u64,

    /// Jobs dead-lettered.
    pub dead_letter: u64,
}
