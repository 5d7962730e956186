//! Enqueue with broker-outage backoff.

use crate::config::ProducerConfig;
use crate::error::{JobError, JobResult};
use crate::job::{JobEnvelope, JobId};
use crate::metrics::JobMetrics;
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{error, warn};

/// Producer side of every queue family.
///
/// Retryable enqueue errors (broker unavailable, pool exhausted) are retried
/// with exponential backoff; once attempts run out the caller receives
/// [`JobError::Delivery`].
#[derive(Clone)]
pub struct JobProducer {
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
}

impl JobProducer {
    /// Creates a producer over `queue`.
    pub fn new(queue: Arc<dyn JobQueue>, config: &ProducerConfig) -> Self {
        Self {
            queue,
            policy: config.policy(),
        }
    }

    /// Overrides the backoff policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Enqueue one job.
    pub async fn enqueue(&self, envelope: JobEnvelope) -> JobResult<JobId> {
        let kind = envelope.kind();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.queue.enqueue(envelope.clone()).await {
                Ok(job_id) => return Ok(job_id),
                Err(e) if e.is_retryable() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        job_id = %envelope.job_id,
                        queue = %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Enqueue failed, backing off"
                    );
                    JobMetrics::enqueue_retried(kind.as_str());
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    error!(job_id = %envelope.job_id, queue = %kind, attempts = attempt, error = %e, "Giving up on enqueue");
                    return Err(JobError::Delivery {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Enqueue jobs in order, stopping at the first failure.
    pub async fn enqueue_all(&self, envelopes: Vec<JobEnvelope>) -> JobResult<Vec<JobId>> {
        let mut ids = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            ids.push(self.enqueue(envelope).await?);
        }
        Ok(ids)
    }
}
