//! Per-timestep rendering.

use super::analysis::remove_input;
use crate::error::{JobError, JobResult};
use crate::job::{JobContext, JobEnvelope, JobId, JobPayload, QueueKind, RasterizerJob};
use crate::plugin::{config_to_args, CommandRunner, PluginRegistry};
use crate::producer::JobProducer;
use crate::worker::JobHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use volterra_trajectory::{write_dump, FrameStore};

/// Timesteps of one trajectory to render.
#[derive(Debug, Clone, Default)]
pub struct RasterizeRequest {
    pub team_id: String,
    pub trajectory_id: String,
    pub folder_path: PathBuf,
    pub timesteps: Vec<u64>,
    pub opts: serde_json::Map<String, serde_json::Value>,
    pub session_id: Option<String>,
    pub session_start_time: Option<DateTime<Utc>>,
}

/// Enqueues one rasterizer job per timestep.
pub async fn enqueue_rasterization(
    producer: &JobProducer,
    request: RasterizeRequest,
) -> JobResult<Vec<JobId>> {
    if request.timesteps.is_empty() {
        return Err(JobError::validation("no timesteps to rasterize"));
    }

    let envelopes = request
        .timesteps
        .iter()
        .map(|&timestep| {
            let job = RasterizerJob {
                trajectory_id: request.trajectory_id.clone(),
                folder_path: request.folder_path.clone(),
                opts: request.opts.clone(),
                session_start_time: request.session_start_time,
                timestep,
            };
            JobEnvelope::new(&request.team_id, JobPayload::Rasterizer(job))
                .with_session(request.session_id.clone())
        })
        .collect();

    producer.enqueue_all(envelopes).await
}

fn raster_dir(folder: &Path) -> PathBuf {
    folder.join("raster")
}

/// Renders one timestep with the configured rasterizer executable.
///
/// Failures stay with the timestep; nothing else in the pipeline waits on it.
pub struct RasterizerProcessor {
    frames: Arc<dyn FrameStore>,
    registry: Arc<PluginRegistry>,
    runner: Arc<dyn CommandRunner>,
}

impl RasterizerProcessor {
    pub fn new(
        frames: Arc<dyn FrameStore>,
        registry: Arc<PluginRegistry>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            frames,
            registry,
            runner,
        }
    }
}

#[async_trait]
impl JobHandler for RasterizerProcessor {
    fn kind(&self) -> QueueKind {
        QueueKind::Rasterizer
    }

    async fn handle(&self, envelope: &JobEnvelope, _ctx: &JobContext) -> JobResult<Option<serde_json::Value>> {
        let JobPayload::Rasterizer(job) = &envelope.payload else {
            return Err(JobError::validation("expected a rasterizer job"));
        };
        let command = self.registry.rasterizer()?;

        let frame = self
            .frames
            .get(&job.trajectory_id, job.timestep)
            .await?
            .ok_or_else(|| {
                JobError::NotFound(format!("frame {} of trajectory {}", job.timestep, job.trajectory_id))
            })?;

        let dir = raster_dir(&job.folder_path);
        tokio::fs::create_dir_all(&dir).await?;
        let input = dir.join(format!("{}.lammpstrj", job.timestep));
        let output = dir.join(format!("{}.png", job.timestep));

        let mut text = Vec::new();
        write_dump(&frame, &mut text)?;
        tokio::fs::write(&input, text).await?;

        let mut args = vec![
            input.to_string_lossy().into_owned(),
            "--output".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        args.extend(config_to_args(&serde_json::Value::Object(job.opts.clone())));

        let result = self.runner.execute(command, &args, &job.folder_path).await;
        remove_input(&input).await;
        result?.into_result()?;
        debug!(trajectory_id = %job.trajectory_id, timestep = job.timestep, "Rasterized frame");

        Ok(Some(json!({
            "timestep": job.timestep,
            "output": output,
        })))
    }
}
