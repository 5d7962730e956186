//! Worker pool for processing jobs.

use crate::config::WorkerConfig;
use crate::error::{JobError, JobResult};
use crate::events::{publish_quietly, EventPublisher, JobUpdate, UpdateStatus};
use crate::job::{JobContext, JobEnvelope, JobId, QueueKind};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::{FailOutcome, JobQueue};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent jobs.
    pub concurrency: usize,

    /// Job execution timeout.
    pub job_timeout: Duration,

    /// Polling interval.
    pub poll_interval: Duration,

    /// Shutdown timeout.
    pub shutdown_timeout: Duration,

    /// How long a claim stays invisible to other workers.
    pub visibility_timeout: Duration,

    /// How often expired claims are handed back.
    pub recovery_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            job_timeout: config.job_timeout(),
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            visibility_timeout: config.visibility_timeout(),
            recovery_interval: config.recovery_interval(),
        }
    }
}

/// Processes the jobs of one queue family.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Queue this handler consumes.
    fn kind(&self) -> QueueKind;

    /// Runs one job. The returned value is attached to the completion update.
    async fn handle(
        &self,
        envelope: &JobEnvelope,
        ctx: &JobContext,
    ) -> JobResult<Option<serde_json::Value>>;

    /// Called after the queue dead-lettered a job, including jobs cut off by
    /// the pool's timeout before `handle` could record anything.
    async fn on_dead_letter(&self, _envelope: &JobEnvelope, _error: &JobError) -> JobResult<()> {
        Ok(())
    }
}

/// How a claimed job was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; completion marker written.
    Completed,
    /// Redelivery of a job that already completed.
    Skipped,
    /// Handler failed or timed out.
    Failed(FailOutcome),
}

/// One job settled by [`WorkerPool::run_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

struct PoolInner {
    id: String,
    kind: QueueKind,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    events: Arc<dyn EventPublisher>,
    config: WorkerPoolConfig,
    running: AtomicBool,
    stop_requested: AtomicBool,
    active: AtomicUsize,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_skipped: AtomicU64,
}

impl PoolInner {
    async fn claim(&self, worker_id: &str) -> JobResult<Option<JobEnvelope>> {
        self.queue
            .dequeue(self.kind, worker_id, self.config.visibility_timeout)
            .await
    }

    async fn process(&self, envelope: JobEnvelope, worker_id: &str) -> JobResult<JobOutcome> {
        let job_id = envelope.job_id.clone();
        let queue_name = self.kind.as_str();

        if self.queue.is_completed(&job_id).await? {
            debug!(job_id = %job_id, "Skipping redelivered job that already completed");
            self.queue.complete(&job_id).await?;
            JobMetrics::job_skipped(queue_name);
            self.jobs_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(JobOutcome::Skipped);
        }

        let ctx = envelope.to_context(worker_id);
        debug!(
            job_id = %job_id,
            attempt = ctx.attempt,
            worker_id = %worker_id,
            "Processing job"
        );
        publish_quietly(
            self.events.as_ref(),
            &envelope.team_id,
            JobUpdate::for_job(&envelope, UpdateStatus::Running),
        )
        .await;

        let started = Instant::now();
        let result = match timeout(self.config.job_timeout, self.handler.handle(&envelope, &ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id = %job_id, timeout_secs = ?self.config.job_timeout, "Job timed out");
                Err(JobError::Timeout(self.config.job_timeout.as_secs()))
            }
        };
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                self.queue.complete(&job_id).await?;
                JobMetrics::job_completed(queue_name, elapsed);
                self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job_id, elapsed_ms = elapsed.as_millis() as u64, "Job completed successfully");

                let mut update = JobUpdate::for_job(&envelope, UpdateStatus::Completed);
                update.result = value;
                update.processing_time_ms = Some(elapsed.as_millis() as u64);
                update.progress = Some(100.0);
                publish_quietly(self.events.as_ref(), &envelope.team_id, update).await;
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Job execution failed");
                JobMetrics::job_failed(queue_name, error_type(&err), elapsed);
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);

                let outcome = self.queue.fail(&job_id, &err).await?;
                if outcome == FailOutcome::DeadLettered {
                    if let Err(e) = self.handler.on_dead_letter(&envelope, &err).await {
                        error!(job_id = %job_id, error = %e, "Dead letter bookkeeping failed");
                    }
                }
                let status = match outcome {
                    FailOutcome::Retried { .. } => UpdateStatus::Retrying,
                    FailOutcome::DeadLettered => UpdateStatus::Failed,
                };
                let mut update = JobUpdate::for_job(&envelope, status);
                update.error = Some(err.to_string());
                update.processing_time_ms = Some(elapsed.as_millis() as u64);
                publish_quietly(self.events.as_ref(), &envelope.team_id, update).await;
                Ok(JobOutcome::Failed(outcome))
            }
        }
    }
}

fn error_type(err: &JobError) -> &'static str {
    match err {
        JobError::Execution { .. } => "execution",
        JobError::Timeout(_) => "timeout",
        JobError::Validation(_) => "validation",
        JobError::FrameInFlight { .. } => "frame_in_flight",
        JobError::NotFound(_) => "not_found",
        JobError::Redis(_) | JobError::Pool(_) | JobError::Unavailable(_) => "broker",
        JobError::Trajectory(_) | JobError::Io(_) => "storage",
        _ => "internal",
    }
}

/// Worker pool for concurrent processing of one queue family.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    /// Create a new worker pool for `handler.kind()`.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        events: Arc<dyn EventPublisher>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let kind = handler.kind();

        Self {
            inner: Arc::new(PoolInner {
                id: format!("{}-{}", kind, Uuid::new_v4()),
                kind,
                queue,
                handler,
                events,
                config,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                jobs_processed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
                jobs_skipped: AtomicU64::new(0),
            }),
            shutdown_tx,
        }
    }

    /// Claims and settles at most one job.
    pub async fn run_once(&self) -> JobResult<Option<ProcessedJob>> {
        let worker_id = format!("{}-inline", self.inner.id);
        let Some(envelope) = self.inner.claim(&worker_id).await? else {
            return Ok(None);
        };
        let job_id = envelope.job_id.clone();
        let outcome = self.inner.process(envelope, &worker_id).await?;
        Ok(Some(ProcessedJob { job_id, outcome }))
    }

    /// Processes ready jobs until the queue is empty. Returns how many were settled.
    pub async fn drain(&self) -> JobResult<usize> {
        let mut settled = 0;
        while self.run_once().await?.is_some() {
            settled += 1;
        }
        Ok(settled)
    }

    /// Start the worker pool; returns after [`stop`](Self::stop).
    pub async fn start(&self) -> JobResult<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Internal("Worker pool already running".to_string()));
        }

        info!(
            pool_id = %inner.id,
            queue = %inner.kind,
            concurrency = inner.config.concurrency,
            "Starting worker pool"
        );

        let semaphore = Arc::new(Semaphore::new(inner.config.concurrency));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut recovery = tokio::time::interval(inner.config.recovery_interval);
        let mut slot = 0u64;

        // A stop issued before the subscription above is only visible here.
        while !inner.stop_requested.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(pool_id = %inner.id, "Received shutdown signal");
                    break;
                }

                _ = recovery.tick() => {
                    if let Err(e) = inner.queue.recover_expired(inner.kind).await {
                        error!(queue = %inner.kind, error = %e, "Failed to recover expired claims");
                    }
                }

                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    slot += 1;
                    let worker_id = format!("{}-{}", inner.id, slot);
                    let pool = Arc::clone(inner);
                    let span = tracing::info_span!("worker", queue = %inner.kind, worker_id = %worker_id);

                    tokio::spawn(async move {
                        match pool.claim(&worker_id).await {
                            Ok(Some(envelope)) => {
                                let busy = pool.active.fetch_add(1, Ordering::SeqCst) + 1;
                                WorkerMetrics::update_active(&pool.id, busy);

                                let job_id = envelope.job_id.clone();
                                if let Err(e) = pool.process(envelope, &worker_id).await {
                                    error!(job_id = %job_id, error = %e, "Failed to settle job");
                                }

                                let busy = pool.active.fetch_sub(1, Ordering::SeqCst) - 1;
                                WorkerMetrics::update_active(&pool.id, busy);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error!(error = %e, "Failed to dequeue job");
                            }
                        }
                        drop(permit);
                    }.instrument(span));
                }
            }

            tokio::time::sleep(inner.config.poll_interval).await;
        }

        info!(pool_id = %inner.id, "Waiting for workers to finish...");
        let concurrency = inner.config.concurrency;
        let _ = timeout(inner.config.shutdown_timeout, async {
            while semaphore.available_permits() < concurrency {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        inner.running.store(false, Ordering::SeqCst);
        info!(
            pool_id = %inner.id,
            processed = inner.jobs_processed.load(Ordering::Relaxed),
            failed = inner.jobs_failed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
        Ok(())
    }

    /// Stop the worker pool.
    pub fn stop(&self) {
        info!(pool_id = %self.inner.id, "Stopping worker pool...");
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.inner.id.clone(),
            queue: self.inner.kind,
            running: self.is_running(),
            concurrency: self.inner.config.concurrency,
            jobs_processed: self.inner.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
            jobs_skipped: self.inner.jobs_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub id: String,
    pub queue: QueueKind,
    pub running: bool,
    pub concurrency: usize,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
}
