//! Analysis scheduling and the per-frame plugin worker.

use crate::error::{JobError, JobResult};
use crate::events::{publish_quietly, EventPublisher, JobUpdate, UpdateStatus};
use crate::job::{AnalysisJob, JobContext, JobEnvelope, JobId, JobPayload, QueueKind};
use crate::metrics::PipelineMetrics;
use crate::plugin::{config_to_args, CommandOutput, CommandRunner, PluginRegistry};
use crate::producer::JobProducer;
use crate::retry::RetryPolicy;
use crate::store::{Analysis, AnalysisStore, CompletionOutcome, TrajectoryStats, TrajectoryStore};
use crate::worker::JobHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use volterra_trajectory::{write_dump, FrameStore};

/// Request to run a plugin over a trajectory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub team_id: String,
    pub trajectory_id: String,
    pub plugin: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Only analyse `timestep`.
    #[serde(default)]
    pub selected_frame_only: bool,
    #[serde(default)]
    pub timestep: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReceipt {
    pub analysis_id: String,
    pub total_frames: u64,
    pub job_ids: Vec<JobId>,
}

/// Result of [`AnalysisScheduler::retry_failed_frames`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySummary {
    pub retried_frames: usize,
    pub total_frames: u64,
    pub failed_timesteps: Vec<u64>,
}

/// Creates analyses and their per-frame jobs.
#[derive(Clone)]
pub struct AnalysisScheduler {
    producer: JobProducer,
    analyses: Arc<dyn AnalysisStore>,
    trajectories: Arc<dyn TrajectoryStore>,
    registry: Arc<PluginRegistry>,
    retry_policy: Option<RetryPolicy>,
}

impl AnalysisScheduler {
    pub fn new(
        producer: JobProducer,
        analyses: Arc<dyn AnalysisStore>,
        trajectories: Arc<dyn TrajectoryStore>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            producer,
            analyses,
            trajectories,
            registry,
            retry_policy: None,
        }
    }

    /// Retry policy stamped on every frame job instead of the envelope default.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Validates the request, stores the analysis and enqueues one job per timestep.
    pub async fn submit(&self, request: AnalysisRequest) -> JobResult<AnalysisReceipt> {
        self.registry.resolve(&request.plugin)?;
        let trajectory = self.trajectory(&request.trajectory_id).await?;

        let timesteps: Vec<u64> = if request.selected_frame_only {
            let timestep = request
                .timestep
                .ok_or_else(|| JobError::validation("selected frame analysis requires a timestep"))?;
            if !trajectory.declared_timesteps.contains(&timestep) {
                return Err(JobError::validation(format!(
                    "timestep {timestep} is not part of trajectory {}",
                    request.trajectory_id
                )));
            }
            vec![timestep]
        } else {
            trajectory.declared_timesteps.iter().copied().collect()
        };
        if timesteps.is_empty() {
            return Err(JobError::validation(format!(
                "trajectory {} has no frames to analyse",
                request.trajectory_id
            )));
        }

        let analysis = Analysis::new(
            &request.team_id,
            &request.trajectory_id,
            &request.plugin,
            request.config.clone(),
            timesteps.len() as u64,
        );
        self.analyses.create(&analysis, &timesteps).await?;

        let job_ids = self
            .enqueue_frames(
                &analysis,
                &trajectory,
                &timesteps,
                request.session_id,
                request.session_start_time,
            )
            .await?;

        info!(
            analysis_id = %analysis.id,
            plugin = %analysis.plugin,
            trajectory_id = %analysis.trajectory_id,
            frames = timesteps.len(),
            "Analysis submitted"
        );

        Ok(AnalysisReceipt {
            analysis_id: analysis.id,
            total_frames: analysis.total_frames,
            job_ids,
        })
    }

    /// Re-enqueues every expected timestep that is neither completed nor pending.
    ///
    /// A second call with nothing newly failed retries nothing.
    pub async fn retry_failed_frames(
        &self,
        analysis_id: &str,
        session_id: Option<String>,
    ) -> JobResult<RetrySummary> {
        let analysis = self.progress(analysis_id).await?;
        if analysis.is_cancelled() {
            return Ok(RetrySummary {
                retried_frames: 0,
                total_frames: analysis.total_frames,
                failed_timesteps: Vec::new(),
            });
        }

        let trajectory = self.trajectory(&analysis.trajectory_id).await?;
        let retry = self.analyses.take_retryable(analysis_id).await?;
        if !retry.is_empty() {
            self.enqueue_frames(&analysis, &trajectory, &retry, session_id, None)
                .await?;
            info!(analysis_id = %analysis_id, frames = retry.len(), "Re-enqueued failed frames");
        }

        Ok(RetrySummary {
            retried_frames: retry.len(),
            total_frames: analysis.total_frames,
            failed_timesteps: retry,
        })
    }

    /// Stops issuing work for an analysis; later completions become no-ops.
    pub async fn cancel(&self, analysis_id: &str) -> JobResult<bool> {
        let cancelled = self.analyses.cancel(analysis_id).await?;
        if cancelled {
            info!(analysis_id = %analysis_id, "Analysis cancelled");
        }
        Ok(cancelled)
    }

    /// Current state, for clients that missed updates.
    pub async fn progress(&self, analysis_id: &str) -> JobResult<Analysis> {
        self.analyses
            .get(analysis_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("analysis {analysis_id}")))
    }

    async fn trajectory(&self, trajectory_id: &str) -> JobResult<TrajectoryStats> {
        self.trajectories
            .get(trajectory_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("trajectory {trajectory_id}")))
    }

    async fn enqueue_frames(
        &self,
        analysis: &Analysis,
        trajectory: &TrajectoryStats,
        timesteps: &[u64],
        session_id: Option<String>,
        session_start_time: Option<DateTime<Utc>>,
    ) -> JobResult<Vec<JobId>> {
        let mut job_ids = Vec::with_capacity(timesteps.len());

        for (index, &timestep) in timesteps.iter().enumerate() {
            let job = AnalysisJob {
                trajectory_id: analysis.trajectory_id.clone(),
                folder_path: trajectory.folder_path.clone(),
                config: analysis.config.clone(),
                input_file: analysis_input_path(&trajectory.folder_path, &analysis.id, timestep),
                analysis_id: analysis.id.clone(),
                analysis_key: analysis.key(),
                plugin: analysis.plugin.clone(),
                session_start_time,
                timestep,
            };
            let mut envelope = JobEnvelope::new(&analysis.team_id, JobPayload::AnalysisProcessing(job))
                .with_session(session_id.clone());
            if let Some(policy) = &self.retry_policy {
                envelope = envelope.with_retry(policy.clone());
            }

            match self.producer.enqueue(envelope).await {
                Ok(job_id) => job_ids.push(job_id),
                Err(e) => {
                    // Frames that never reached the queue must stay retryable.
                    self.analyses
                        .unmark_pending(&analysis.id, &timesteps[index..])
                        .await?;
                    return Err(e);
                }
            }
        }
        Ok(job_ids)
    }
}

/// Runs the plugin over one frame.
pub struct AnalysisProcessor {
    frames: Arc<dyn FrameStore>,
    analyses: Arc<dyn AnalysisStore>,
    registry: Arc<PluginRegistry>,
    runner: Arc<dyn CommandRunner>,
    events: Arc<dyn EventPublisher>,
    guard_ttl: Duration,
}

impl AnalysisProcessor {
    pub fn new(
        frames: Arc<dyn FrameStore>,
        analyses: Arc<dyn AnalysisStore>,
        registry: Arc<PluginRegistry>,
        runner: Arc<dyn CommandRunner>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            frames,
            analyses,
            registry,
            runner,
            events,
            guard_ttl: Duration::from_secs(600),
        }
    }

    /// How long the in-flight guard survives a crashed worker.
    pub fn with_guard_ttl(mut self, ttl: Duration) -> Self {
        self.guard_ttl = ttl;
        self
    }

    async fn run_plugin(&self, job: &AnalysisJob) -> JobResult<CommandOutput> {
        let frame = self
            .frames
            .get(&job.trajectory_id, job.timestep)
            .await?
            .ok_or_else(|| {
                JobError::NotFound(format!(
                    "frame {} of trajectory {}",
                    job.timestep, job.trajectory_id
                ))
            })?;

        let mut text = Vec::new();
        write_dump(&frame, &mut text)?;
        if let Some(parent) = job.input_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&job.input_file, text).await?;

        let output = self.execute(job).await;
        remove_input(&job.input_file).await;
        output?.into_result()
    }

    async fn execute(&self, job: &AnalysisJob) -> JobResult<CommandOutput> {
        let command = self.registry.resolve(&job.plugin)?;
        let mut args = vec![
            job.input_file.to_string_lossy().into_owned(),
            "--timestep".to_string(),
            job.timestep.to_string(),
        ];
        args.extend(config_to_args(&job.config));
        self.runner.execute(command, &args, &job.folder_path).await
    }
}

/// Deletes a plugin input once the plugin has exited.
pub(crate) async fn remove_input(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove plugin input"),
    }
}

/// Removes the per-analysis input folder once no frame needs it.
async fn remove_input_dir(job: &AnalysisJob) {
    let Some(dir) = job.input_file.parent() else { return };
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(analysis_id = %job.analysis_id, "Removed analysis input folder"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove analysis input folder"),
    }
}

#[async_trait]
impl JobHandler for AnalysisProcessor {
    fn kind(&self) -> QueueKind {
        QueueKind::AnalysisProcessing
    }

    async fn handle(&self, envelope: &JobEnvelope, ctx: &JobContext) -> JobResult<Option<serde_json::Value>> {
        let JobPayload::AnalysisProcessing(job) = &envelope.payload else {
            return Err(JobError::validation("expected an analysis job"));
        };

        let Some(analysis) = self.analyses.get(&job.analysis_id).await? else {
            return Err(JobError::NotFound(format!("analysis {}", job.analysis_id)));
        };
        if analysis.is_cancelled() {
            debug!(analysis_id = %job.analysis_id, timestep = job.timestep, "Analysis cancelled, skipping frame");
            return Ok(Some(json!({ "skipped": "cancelled" })));
        }

        let holder = ctx.job_id.to_string();
        if !self
            .analyses
            .claim_frame(&job.analysis_id, job.timestep, &holder, self.guard_ttl)
            .await?
        {
            return Err(JobError::FrameInFlight {
                analysis_id: job.analysis_id.clone(),
                timestep: job.timestep,
            });
        }

        let result = self.run_plugin(job).await;
        if let Err(e) = self
            .analyses
            .release_frame(&job.analysis_id, job.timestep, &holder)
            .await
        {
            warn!(analysis_id = %job.analysis_id, timestep = job.timestep, error = %e, "Failed to release frame guard");
        }

        let output = result?;

        let outcome = self
            .analyses
            .record_completion(&job.analysis_id, job.timestep)
            .await?;

        if let CompletionOutcome::Recorded {
            completed_frames,
            total_frames,
            finished,
        } = outcome
        {
            PipelineMetrics::analysis_frame_completed(&job.plugin);
            if finished {
                let mut update = JobUpdate::for_job(envelope, UpdateStatus::Completed)
                    .with_type("analysis_completed")
                    .with_result(json!({
                        "completedFrames": completed_frames,
                        "totalFrames": total_frames,
                    }));
                update.progress = Some(100.0);
                publish_quietly(self.events.as_ref(), &envelope.team_id, update).await;
                info!(analysis_id = %job.analysis_id, total_frames, "Analysis completed");
                remove_input_dir(job).await;
            }
        }

        let stdout: Option<serde_json::Value> = serde_json::from_str(output.stdout.trim()).ok();
        Ok(Some(json!({
            "analysisId": job.analysis_id,
            "timestep": job.timestep,
            "output": stdout,
        })))
    }

    /// Settles the frame as failed so `retry_failed_frames` can pick it up.
    async fn on_dead_letter(&self, envelope: &JobEnvelope, error: &JobError) -> JobResult<()> {
        let JobPayload::AnalysisProcessing(job) = &envelope.payload else {
            return Ok(());
        };
        // A timed-out attempt never reached its own release or cleanup.
        remove_input(&job.input_file).await;
        self.analyses
            .release_frame(&job.analysis_id, job.timestep, envelope.job_id.as_str())
            .await?;
        if self
            .analyses
            .record_failure(&job.analysis_id, job.timestep, &error.to_string())
            .await?
        {
            PipelineMetrics::analysis_frame_failed(&job.plugin);
        }
        Ok(())
    }
}

/// Where the analysis input for `timestep` lives under a trajectory folder.
pub fn analysis_input_path(folder: &Path, analysis_id: &str, timestep: u64) -> PathBuf {
    folder
        .join("analyses")
        .join(analysis_id)
        .join(format!("{timestep}.lammpstrj"))
}
