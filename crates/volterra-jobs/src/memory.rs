//! Single-process job queue.
//!
//! Mirrors the Redis layout (ready, delayed and claim sets per queue plus
//! completion markers) behind one mutex. Used by tests and local runs.
//! Completion markers expire like the Redis ones and are pruned as new
//! jobs complete.

use crate::config::QueueConfig;
use crate::error::{JobError, JobResult};
use crate::job::{JobEnvelope, JobId, QueueKind};
use crate::metrics::JobMetrics;
use crate::queue::{fail_decision, FailOutcome, JobQueue, QueueStats};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct KindState {
    /// (-priority, ready_at_ms, seq)
    ready: BTreeMap<(i16, i64, u64), JobId>,
    /// (ready_at_ms, seq)
    delayed: BTreeMap<(i64, u64), JobId>,
    /// job id -> claim deadline (ms)
    active: HashMap<JobId, i64>,
    completed: u64,
    retried: u64,
    dead_letter: u64,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobEnvelope>,
    kinds: HashMap<QueueKind, KindState>,
    queued: HashSet<JobId>,
    /// job id -> marker expiry (ms)
    completed: HashMap<JobId, i64>,
    /// Markers in expiry order; entries superseded by a later completion are skipped.
    completion_order: VecDeque<(i64, JobId)>,
    dead_letters: Vec<JobId>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_ready(&mut self, kind: QueueKind, id: JobId, priority: i8, ready_at_ms: i64) {
        let seq = self.next_seq();
        self.queued.insert(id.clone());
        self.kinds
            .entry(kind)
            .or_default()
            .ready
            .insert((-i16::from(priority), ready_at_ms, seq), id);
    }

    fn push_delayed(&mut self, kind: QueueKind, id: JobId, ready_at_ms: i64) {
        let seq = self.next_seq();
        self.queued.insert(id.clone());
        self.kinds
            .entry(kind)
            .or_default()
            .delayed
            .insert((ready_at_ms, seq), id);
    }

    fn mark_completed(&mut self, job_id: &JobId, expires_at_ms: i64) {
        self.completed.insert(job_id.clone(), expires_at_ms);
        self.completion_order.push_back((expires_at_ms, job_id.clone()));
    }

    fn prune_completed(&mut self, now_ms: i64) -> usize {
        let mut pruned = 0;
        while let Some((expires_at, _)) = self.completion_order.front() {
            if *expires_at > now_ms {
                break;
            }
            let Some((expires_at, id)) = self.completion_order.pop_front() else {
                break;
            };
            if self.completed.get(&id) == Some(&expires_at) {
                self.completed.remove(&id);
                pruned += 1;
            }
        }
        pruned
    }

    fn promote_due(&mut self, kind: QueueKind, now_ms: i64) {
        let due: Vec<((i64, u64), JobId)> = match self.kinds.get_mut(&kind) {
            Some(state) => {
                let later = state.delayed.split_off(&(now_ms + 1, 0));
                std::mem::replace(&mut state.delayed, later).into_iter().collect()
            }
            None => return,
        };
        for ((ready_at, _), id) in due {
            let priority = self.jobs.get(&id).map_or(0, |job| job.priority);
            self.push_ready(kind, id, priority, ready_at);
        }
    }
}

/// In-memory [`JobQueue`].
pub struct MemoryJobQueue {
    state: Mutex<State>,
    completion_ttl: Duration,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            completion_ttl: QueueConfig::default().completion_ttl(),
        }
    }
}

impl MemoryJobQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long completion markers are kept.
    pub fn with_completion_ttl(mut self, ttl: Duration) -> Self {
        self.completion_ttl = ttl;
        self
    }

    /// Envelopes that were dead-lettered, oldest first.
    pub fn dead_letters(&self) -> Vec<JobEnvelope> {
        let state = self.state.lock();
        state
            .dead_letters
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    /// Looks up a stored envelope.
    pub fn get(&self, job_id: &JobId) -> Option<JobEnvelope> {
        self.state.lock().jobs.get(job_id).cloned()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> JobResult<JobId> {
        let job_id = envelope.job_id.clone();
        let kind = envelope.kind();
        let now_ms = Utc::now().timestamp_millis();
        let ready_at = envelope.scheduled_at.timestamp_millis();
        let priority = envelope.priority;

        let mut state = self.state.lock();
        state.jobs.insert(job_id.clone(), envelope);
        if ready_at > now_ms {
            state.push_delayed(kind, job_id.clone(), ready_at);
        } else {
            state.push_ready(kind, job_id.clone(), priority, now_ms);
        }
        drop(state);

        JobMetrics::job_enqueued(kind.as_str());
        debug!(job_id = %job_id, queue = %kind, "Enqueued job");
        Ok(job_id)
    }

    async fn dequeue(
        &self,
        kind: QueueKind,
        worker_id: &str,
        visibility: Duration,
    ) -> JobResult<Option<JobEnvelope>> {
        let now_ms = Utc::now().timestamp_millis();
        let deadline = now_ms + i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX / 2);

        let mut state = self.state.lock();
        state.promote_due(kind, now_ms);

        loop {
            let Some((_, job_id)) = state.kinds.get_mut(&kind).and_then(|k| k.ready.pop_first()) else {
                return Ok(None);
            };
            state.queued.remove(&job_id);

            let Some(envelope) = state.jobs.get_mut(&job_id) else {
                debug!(job_id = %job_id, "Dropping queued id without job data");
                continue;
            };
            envelope.attempt += 1;
            let claimed = envelope.clone();

            state
                .kinds
                .entry(kind)
                .or_default()
                .active
                .insert(job_id.clone(), deadline);
            drop(state);

            JobMetrics::job_dequeued(kind.as_str());
            debug!(
                job_id = %job_id,
                queue = %kind,
                attempt = claimed.attempt,
                worker_id = %worker_id,
                "Dequeued job"
            );
            return Ok(Some(claimed));
        }
    }

    async fn complete(&self, job_id: &JobId) -> JobResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(self.completion_ttl.as_millis()).unwrap_or(i64::MAX / 2);

        let mut state = self.state.lock();
        let pruned = state.prune_completed(now_ms);
        if pruned > 0 {
            debug!(pruned, "Pruned expired completion markers");
        }
        state.mark_completed(job_id, now_ms + ttl_ms);

        if let Some(kind) = state.jobs.get(job_id).map(JobEnvelope::kind) {
            let kind_state = state.kinds.entry(kind).or_default();
            if kind_state.active.remove(job_id).is_some() {
                kind_state.completed += 1;
            }
            if !state.queued.contains(job_id) {
                state.jobs.remove(job_id);
            }
        }

        debug!(job_id = %job_id, "Completed job");
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, error: &JobError) -> JobResult<FailOutcome> {
        let mut state = self.state.lock();
        let Some(envelope) = state.jobs.get_mut(job_id) else {
            return Err(JobError::NotFound(job_id.to_string()));
        };
        envelope.last_error = Some(error.to_string());
        let outcome = fail_decision(envelope, error);
        let kind = envelope.kind();

        if let FailOutcome::Retried { retry_at } = outcome {
            envelope.scheduled_at = retry_at;
        }

        let kind_state = state.kinds.entry(kind).or_default();
        kind_state.active.remove(job_id);
        match outcome {
            FailOutcome::Retried { retry_at } => {
                kind_state.retried += 1;
                state.push_delayed(kind, job_id.clone(), retry_at.timestamp_millis());
                JobMetrics::job_retried(kind.as_str());
                debug!(job_id = %job_id, retry_at = %retry_at, "Scheduled job retry");
            }
            FailOutcome::DeadLettered => {
                kind_state.dead_letter += 1;
                state.dead_letters.push(job_id.clone());
                JobMetrics::job_dead_lettered(kind.as_str());
                debug!(job_id = %job_id, error = %error, "Dead-lettered job");
            }
        }

        Ok(outcome)
    }

    async fn is_completed(&self, job_id: &JobId) -> JobResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        Ok(self
            .state
            .lock()
            .completed
            .get(job_id)
            .is_some_and(|expires_at| *expires_at > now_ms))
    }

    async fn recover_expired(&self, kind: QueueKind) -> JobResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.lock();

        let expired: Vec<JobId> = match state.kinds.get_mut(&kind) {
            Some(kind_state) => {
                let ids: Vec<JobId> = kind_state
                    .active
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now_ms)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &ids {
                    kind_state.active.remove(id);
                }
                ids
            }
            None => return Ok(0),
        };

        for id in &expired {
            let priority = state.jobs.get(id).map_or(0, |job| job.priority);
            state.push_ready(kind, id.clone(), priority, now_ms);
        }

        let count = expired.len() as u64;
        if count > 0 {
            JobMetrics::jobs_recovered(kind.as_str(), count);
            debug!(queue = %kind, count, "Recovered expired claims");
        }
        Ok(count)
    }

    async fn queue_length(&self, kind: QueueKind) -> JobResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.lock();
        state.promote_due(kind, now_ms);
        Ok(state.kinds.get(&kind).map_or(0, |k| k.ready.len() as u64))
    }

    async fn stats(&self, kind: QueueKind) -> JobResult<QueueStats> {
        let state = self.state.lock();
        let stats = state.kinds.get(&kind).map_or_else(
            || QueueStats {
                queue: kind.as_str().to_string(),
                ..QueueStats::default()
            },
            |k| QueueStats {
                queue: kind.as_str().to_string(),
                pending: k.ready.len() as u64,
                active: k.active.len() as u64,
                delayed: k.delayed.len() as u64,
                completed: k.completed,
                retried: k.retried,
                dead_letter: k.dead_letter,
            },
        );
        JobMetrics::update_queue_sizes(kind.as_str(), stats.pending, stats.active);
        Ok(stats)
    }

    async fn health_check(&self) -> JobResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, RasterizerJob};
    use crate::retry::RetryPolicy;
    use chrono::Duration as ChronoDuration;

    fn envelope(timestep: u64) -> JobEnvelope {
        JobEnvelope::new(
            "team-1",
            JobPayload::Rasterizer(RasterizerJob {
                trajectory_id: "t1".into(),
                folder_path: "/tmp/t1".into(),
                opts: Default::default(),
                session_start_time: None,
                timestep,
            }),
        )
    }

    const VISIBILITY: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = MemoryJobQueue::new();
        let first = queue.enqueue(envelope(1)).await.unwrap();
        let second = queue.enqueue(envelope(2)).await.unwrap();
        let urgent = queue.enqueue(envelope(3).with_priority(10)).await.unwrap();

        let kind = QueueKind::Rasterizer;
        let order: Vec<JobId> = vec![
            queue.dequeue(kind, "w", VISIBILITY).await.unwrap().unwrap().job_id,
            queue.dequeue(kind, "w", VISIBILITY).await.unwrap().unwrap().job_id,
            queue.dequeue(kind, "w", VISIBILITY).await.unwrap().unwrap().job_id,
        ];
        assert_eq!(order, vec![urgent, first, second]);
        assert!(queue.dequeue(kind, "w", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queues_are_separate() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(envelope(1)).await.unwrap();
        assert!(queue
            .dequeue(QueueKind::AnalysisProcessing, "w", VISIBILITY)
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.queue_length(QueueKind::Rasterizer).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_complete_writes_marker() {
        let queue = MemoryJobQueue::new();
        let id = queue.enqueue(envelope(1)).await.unwrap();
        let job = queue.dequeue(QueueKind::Rasterizer, "w", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);

        assert!(!queue.is_completed(&id).await.unwrap());
        queue.complete(&id).await.unwrap();
        assert!(queue.is_completed(&id).await.unwrap());

        let stats = queue.stats(QueueKind::Rasterizer).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_completion_markers_expire_and_are_pruned() {
        let queue = MemoryJobQueue::new().with_completion_ttl(Duration::from_millis(20));
        let kind = QueueKind::Rasterizer;
        let first = queue.enqueue(envelope(1)).await.unwrap();
        queue.dequeue(kind, "w", VISIBILITY).await.unwrap().unwrap();
        queue.complete(&first).await.unwrap();
        assert!(queue.is_completed(&first).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!queue.is_completed(&first).await.unwrap());

        let second = queue.enqueue(envelope(1)).await.unwrap();
        queue.dequeue(kind, "w", VISIBILITY).await.unwrap().unwrap();
        queue.complete(&second).await.unwrap();

        let state = queue.state.lock();
        assert_eq!(state.completed.len(), 1);
        assert!(state.completed.contains_key(&second));
        assert_eq!(state.completion_order.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_claim_is_redelivered() {
        let queue = MemoryJobQueue::new();
        let id = queue.enqueue(envelope(1)).await.unwrap();
        let kind = QueueKind::Rasterizer;

        queue.dequeue(kind, "crashed", Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.dequeue(kind, "w2", VISIBILITY).await.unwrap().is_none());

        assert_eq!(queue.recover_expired(kind).await.unwrap(), 1);
        let again = queue.dequeue(kind, "w2", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.job_id, id);
        assert_eq!(again.attempt, 2);

        // Live claims are not touched.
        assert_eq!(queue.recover_expired(kind).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_delayed() {
        let queue = MemoryJobQueue::new();
        let id = queue
            .enqueue(envelope(1).with_retry(RetryPolicy::fixed(2, 60_000)))
            .await
            .unwrap();
        let kind = QueueKind::Rasterizer;
        queue.dequeue(kind, "w", VISIBILITY).await.unwrap();

        let outcome = queue.fail(&id, &JobError::Timeout(1)).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retried { .. }));

        let stats = queue.stats(kind).await.unwrap();
        assert_eq!((stats.delayed, stats.retried, stats.active), (1, 1, 0));
        assert!(queue.dequeue(kind, "w", VISIBILITY).await.unwrap().is_none());
        assert_eq!(queue.get(&id).unwrap().last_error.as_deref(), Some("Job timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn test_due_delayed_job_is_promoted() {
        let queue = MemoryJobQueue::new();
        let mut job = envelope(1);
        job.scheduled_at = Utc::now() + ChronoDuration::milliseconds(30);
        let id = queue.enqueue(job).await.unwrap();

        assert_eq!(queue.queue_length(QueueKind::Rasterizer).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let claimed = queue
            .dequeue(QueueKind::Rasterizer, "w", VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.job_id, id);
    }

    #[tokio::test]
    async fn test_terminal_failure_dead_letters() {
        let queue = MemoryJobQueue::new();
        let mut job = envelope(1);
        job.scheduled_at -= ChronoDuration::seconds(1);
        let id = queue.enqueue(job).await.unwrap();
        queue.dequeue(QueueKind::Rasterizer, "w", VISIBILITY).await.unwrap();

        let outcome = queue
            .fail(&id, &JobError::execution(Some(1), "bad"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);
        assert_eq!(queue.dead_letters().len(), 1);
        assert!(!queue.is_completed(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_unknown_job() {
        let queue = MemoryJobQueue::new();
        let err = queue
            .fail(&JobId::from("missing"), &JobError::Timeout(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }
}
