//! Trajectory ingestion: upload splitting, chunk jobs and the chunk worker.

use crate::error::{JobError, JobResult};
use crate::events::{publish_quietly, EventPublisher, JobUpdate, UpdateStatus};
use crate::job::{
    FrameFile, JobContext, JobEnvelope, JobId, JobPayload, QueueKind, TrajectoryProcessingJob,
};
use crate::metrics::PipelineMetrics;
use crate::producer::JobProducer;
use crate::store::{ChunkOutcome, FailedFrame, TrajectoryStats, TrajectoryStore};
use crate::worker::JobHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use volterra_trajectory::{
    parse_frame, FrameInfo, FrameStore, RawFrameSplitter, TrajectoryFrame, TrajectoryResult,
};

const FRAME_FILE_EXTENSION: &str = "lammpstrj";

/// Upload to split and ingest.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub team_id: String,
    /// Generated when absent.
    pub trajectory_id: Option<String>,
    pub name: String,
    pub folder_id: Option<String>,
    /// Dump files, read in order.
    pub sources: Vec<PathBuf>,
    pub session_id: Option<String>,
}

/// What an ingest produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub trajectory_id: String,
    pub total_frames: usize,
    pub total_chunks: u32,
    pub job_ids: Vec<JobId>,
    /// Blocks without a numeric timestep or repeating an earlier one.
    pub skipped_blocks: usize,
}

/// Result of [`TrajectoryIngestor::retry_failed_frames`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRetrySummary {
    pub retried_frames: usize,
    pub failed_timesteps: Vec<u64>,
}

/// Splits uploads into per-frame files and enqueues chunk jobs.
#[derive(Clone)]
pub struct TrajectoryIngestor {
    producer: JobProducer,
    trajectories: Arc<dyn TrajectoryStore>,
    storage_root: PathBuf,
    chunk_size: usize,
}

impl TrajectoryIngestor {
    pub fn new(
        producer: JobProducer,
        trajectories: Arc<dyn TrajectoryStore>,
        storage_root: impl Into<PathBuf>,
        chunk_size: usize,
    ) -> Self {
        Self {
            producer,
            trajectories,
            storage_root: storage_root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Folder holding a trajectory's files.
    pub fn folder_for(&self, trajectory_id: &str) -> PathBuf {
        self.storage_root.join(trajectory_id)
    }

    /// Splits every source, registers the trajectory and enqueues its chunks.
    pub async fn ingest(&self, request: IngestRequest) -> JobResult<IngestReceipt> {
        let trajectory_id = match request.trajectory_id.clone() {
            Some(id) => id,
            None => Uuid::now_v7().simple().to_string(),
        };
        if trajectory_id.is_empty()
            || !trajectory_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(JobError::validation(format!("invalid trajectory id '{trajectory_id}'")));
        }
        if request.sources.is_empty() {
            return Err(JobError::validation("no trajectory files provided"));
        }

        let folder = self.folder_for(&trajectory_id);
        let frames_dir = folder.join("frames");
        let sources = request.sources.clone();
        let (files, skipped_blocks) =
            tokio::task::spawn_blocking(move || split_sources(&sources, &frames_dir))
                .await
                .map_err(|e| JobError::Internal(format!("split task failed: {e}")))??;

        if files.is_empty() {
            return Err(JobError::validation(format!(
                "no frames found in upload for trajectory {trajectory_id}"
            )));
        }

        let total_chunks = u32::try_from(files.len().div_ceil(self.chunk_size))
            .map_err(|_| JobError::validation("too many chunks"))?;
        let declared: BTreeSet<u64> = files.iter().map(|f| f.frame_info.timestep).collect();
        let mut stats = TrajectoryStats::new(
            &trajectory_id,
            &request.team_id,
            &request.name,
            &folder,
            total_chunks,
            declared,
        );
        stats.folder_id = request.folder_id.clone();
        self.trajectories.register(&stats).await?;

        let job_ids = self
            .enqueue_chunks(&stats, &files, request.session_id.as_deref())
            .await?;

        info!(
            trajectory_id = %trajectory_id,
            frames = files.len(),
            chunks = total_chunks,
            skipped_blocks,
            "Trajectory ingest scheduled"
        );

        Ok(IngestReceipt {
            trajectory_id,
            total_frames: files.len(),
            total_chunks,
            job_ids,
            skipped_blocks,
        })
    }

    /// Enqueues one processing job per `chunk_size` frames.
    pub async fn enqueue_chunks(
        &self,
        stats: &TrajectoryStats,
        files: &[FrameFile],
        session_id: Option<&str>,
    ) -> JobResult<Vec<JobId>> {
        let total_chunks = stats.total_chunks;
        let envelopes = files
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let index = index as u32;
                let job = TrajectoryProcessingJob {
                    trajectory_id: stats.trajectory_id.clone(),
                    trajectory_name: stats.name.clone(),
                    timestep: chunk[0].frame_info.timestep,
                    name: "Trajectory processing".to_string(),
                    message: format!("{}: chunk {}/{}", stats.name, index + 1, total_chunks),
                    folder_id: stats.folder_id.clone(),
                    file: None,
                    files: chunk.to_vec(),
                    chunk_index: index,
                    total_chunks,
                    retry: false,
                };
                JobEnvelope::new(&stats.team_id, JobPayload::TrajectoryProcessing(job))
                    .with_session(session_id.map(str::to_string))
            })
            .collect();

        self.producer.enqueue_all(envelopes).await
    }

    /// Re-enqueues the failed frames as one retry chunk.
    ///
    /// Frames already sitting in a queued retry chunk are left out, so a
    /// repeated call enqueues nothing until that chunk has been recorded.
    pub async fn retry_failed_frames(
        &self,
        trajectory_id: &str,
        session_id: Option<&str>,
    ) -> JobResult<FrameRetrySummary> {
        let (stats, taken) = self
            .trajectories
            .take_retryable_frames(trajectory_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("trajectory {trajectory_id}")))?;
        let failed_timesteps = stats.failed_timesteps();

        if taken.is_empty() {
            return Ok(FrameRetrySummary {
                retried_frames: 0,
                failed_timesteps,
            });
        }

        let timesteps: Vec<u64> = taken.keys().copied().collect();
        let files: Vec<FrameFile> = taken
            .into_iter()
            .map(|(timestep, failed)| FrameFile {
                frame_info: FrameInfo {
                    timestep,
                    atom_count: failed.atom_count,
                },
                frame_file_path: failed.frame_file_path,
                size_bytes: 0,
            })
            .collect();

        let job = TrajectoryProcessingJob {
            trajectory_id: stats.trajectory_id.clone(),
            trajectory_name: stats.name.clone(),
            timestep: files[0].frame_info.timestep,
            name: "Trajectory processing".to_string(),
            message: format!("{}: retrying {} failed frames", stats.name, files.len()),
            folder_id: stats.folder_id.clone(),
            file: None,
            files,
            chunk_index: stats.total_chunks,
            total_chunks: stats.total_chunks,
            retry: true,
        };
        let retried_frames = job.files.len();
        let envelope = JobEnvelope::new(&stats.team_id, JobPayload::TrajectoryProcessing(job))
            .with_session(session_id.map(str::to_string));

        if let Err(e) = self.producer.enqueue(envelope).await {
            self.trajectories.release_retry(trajectory_id, &timesteps).await?;
            return Err(e);
        }

        info!(trajectory_id = %trajectory_id, retried_frames, "Re-enqueued failed frames");
        Ok(FrameRetrySummary {
            retried_frames,
            failed_timesteps,
        })
    }
}

/// Writes each timestep block of `sources` to `<frames_dir>/<timestep>.lammpstrj`.
fn split_sources(sources: &[PathBuf], frames_dir: &Path) -> JobResult<(Vec<FrameFile>, usize)> {
    std::fs::create_dir_all(frames_dir)?;
    let mut seen = BTreeSet::new();
    let mut files = Vec::new();
    let mut skipped = 0;

    for source in sources {
        let reader = BufReader::new(File::open(source)?);
        for raw in RawFrameSplitter::new(reader) {
            let raw = raw?;
            let Some(timestep) = raw.timestep else {
                warn!(source = %source.display(), line = raw.start_line, "Skipping block without timestep");
                skipped += 1;
                continue;
            };
            if !seen.insert(timestep) {
                warn!(source = %source.display(), timestep, "Skipping repeated timestep");
                skipped += 1;
                continue;
            }

            let path = frames_dir.join(format!("{timestep}.{FRAME_FILE_EXTENSION}"));
            let mut out = File::create(&path)?;
            out.write_all(raw.text.as_bytes())?;
            files.push(FrameFile {
                frame_info: FrameInfo {
                    timestep,
                    atom_count: raw.atom_count.unwrap_or(0),
                },
                frame_file_path: path,
                size_bytes: raw.text.len() as u64,
            });
        }
    }

    files.sort_by_key(|f| f.frame_info.timestep);
    Ok((files, skipped))
}

fn decode_file(path: &Path) -> TrajectoryResult<TrajectoryFrame> {
    let file = File::open(path)?;
    Ok(parse_frame(BufReader::new(file))?)
}

/// Decodes and persists the frames of one chunk.
pub struct TrajectoryProcessor {
    frames: Arc<dyn FrameStore>,
    trajectories: Arc<dyn TrajectoryStore>,
    events: Arc<dyn EventPublisher>,
}

impl TrajectoryProcessor {
    pub fn new(
        frames: Arc<dyn FrameStore>,
        trajectories: Arc<dyn TrajectoryStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            frames,
            trajectories,
            events,
        }
    }

    async fn persist(&self, trajectory_id: &str, file: &FrameFile) -> Result<(), String> {
        let path = file.frame_file_path.clone();
        let frame = tokio::task::spawn_blocking(move || decode_file(&path))
            .await
            .map_err(|e| format!("decode task failed: {e}"))?
            .map_err(|e| e.to_string())?;

        if frame.timestep != file.frame_info.timestep {
            return Err(format!(
                "file holds timestep {} instead of {}",
                frame.timestep, file.frame_info.timestep
            ));
        }

        self.frames
            .put(trajectory_id, &frame)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl JobHandler for TrajectoryProcessor {
    fn kind(&self) -> QueueKind {
        QueueKind::TrajectoryProcessing
    }

    async fn handle(&self, envelope: &JobEnvelope, _ctx: &JobContext) -> JobResult<Option<serde_json::Value>> {
        let JobPayload::TrajectoryProcessing(job) = &envelope.payload else {
            return Err(JobError::validation("expected a trajectory processing job"));
        };

        let frames = job.frames();
        let mut outcome = chunk_outcome(job, &frames);

        for file in &frames {
            let timestep = file.frame_info.timestep;
            match self.persist(&job.trajectory_id, file).await {
                Ok(()) => outcome.persisted.push(timestep),
                Err(error) => {
                    warn!(trajectory_id = %job.trajectory_id, timestep, error = %error, "Frame failed");
                    outcome.failed.insert(
                        timestep,
                        FailedFrame {
                            frame_file_path: file.frame_file_path.clone(),
                            atom_count: file.frame_info.atom_count,
                            error,
                        },
                    );
                }
            }
        }

        PipelineMetrics::chunk_processed(outcome.persisted.len(), outcome.failed.len());
        let recorded = self.trajectories.record_chunk(&job.trajectory_id, &outcome).await?;
        debug!(
            trajectory_id = %job.trajectory_id,
            chunk = job.chunk_index,
            retry = job.retry,
            newly_recorded = recorded.newly_recorded,
            "Chunk recorded"
        );

        if recorded.completed_now {
            if let Some(stats) = self.trajectories.get(&job.trajectory_id).await? {
                let mut update = JobUpdate::for_job(envelope, UpdateStatus::Completed)
                    .with_type("trajectory_processed")
                    .with_result(json!({
                        "persistedFrames": stats.persisted_timesteps.len(),
                        "failedFrames": stats.failed_frames.len(),
                        "failedTimesteps": stats.failed_timesteps(),
                    }));
                update.message = Some(format!("{} processed", stats.name));
                publish_quietly(self.events.as_ref(), &envelope.team_id, update).await;
                info!(
                    trajectory_id = %job.trajectory_id,
                    persisted = stats.persisted_timesteps.len(),
                    failed = stats.failed_frames.len(),
                    "Trajectory processed"
                );
            }
        }

        Ok(Some(json!({
            "chunkIndex": job.chunk_index,
            "persisted": outcome.persisted.len(),
            "failed": outcome.failed.len(),
            "failedTimesteps": outcome.failed.keys().collect::<Vec<_>>(),
        })))
    }

    /// Records every frame of a dead-lettered chunk as failed.
    async fn on_dead_letter(&self, envelope: &JobEnvelope, error: &JobError) -> JobResult<()> {
        let JobPayload::TrajectoryProcessing(job) = &envelope.payload else {
            return Ok(());
        };

        let frames = job.frames();
        let mut outcome = chunk_outcome(job, &frames);
        outcome.failed = frames
            .iter()
            .map(|file| {
                (
                    file.frame_info.timestep,
                    FailedFrame {
                        frame_file_path: file.frame_file_path.clone(),
                        atom_count: file.frame_info.atom_count,
                        error: error.to_string(),
                    },
                )
            })
            .collect();

        let recorded = self.trajectories.record_chunk(&job.trajectory_id, &outcome).await?;
        warn!(
            trajectory_id = %job.trajectory_id,
            chunk = job.chunk_index,
            frames = frames.len(),
            newly_recorded = recorded.newly_recorded,
            "Chunk dead-lettered, frames recorded as failed"
        );
        Ok(())
    }
}

/// Empty outcome for `job`; retry chunks do not count toward completion.
fn chunk_outcome(job: &TrajectoryProcessingJob, frames: &[FrameFile]) -> ChunkOutcome {
    ChunkOutcome {
        chunk_index: (!job.retry).then_some(job.chunk_index),
        persisted: Vec::with_capacity(frames.len()),
        failed: BTreeMap::new(),
        files: if job.retry { 0 } else { frames.len() as u64 },
        bytes: if job.retry {
            0
        } else {
            frames.iter().map(|f| f.size_bytes).sum()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProducerConfig;
    use crate::memory::MemoryJobQueue;
    use crate::queue::JobQueue;
    use crate::store::MemoryTrajectoryStore;

    const DUMP: &str = "\
ITEM: TIMESTEP
100
ITEM: NUMBER OF ATOMS
1
ITEM: BOX BOUNDS pp pp pp
0 1
0 1
0 1
ITEM: ATOMS id type x y z
1 1 0.1 0.2 0.3
ITEM: TIMESTEP
200
ITEM: NUMBER OF ATOMS
1
ITEM: BOX BOUNDS pp pp pp
0 1
0 1
0 1
ITEM: ATOMS id type x y z
1 1 0.4 0.5 0.6
ITEM: TIMESTEP
100
ITEM: NUMBER OF ATOMS
1
ITEM: BOX BOUNDS pp pp pp
0 1
0 1
0 1
ITEM: ATOMS id type x y z
1 1 0.1 0.2 0.3
";

    fn ingestor(queue: Arc<MemoryJobQueue>, store: Arc<MemoryTrajectoryStore>, root: &Path) -> TrajectoryIngestor {
        TrajectoryIngestor::new(JobProducer::new(queue, &ProducerConfig::default()), store, root, 1)
    }

    #[tokio::test]
    async fn test_ingest_splits_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("upload.dump");
        std::fs::write(&source, DUMP).unwrap();

        let queue = Arc::new(MemoryJobQueue::new());
        let store = Arc::new(MemoryTrajectoryStore::new());
        let receipt = ingestor(queue.clone(), store.clone(), dir.path())
            .ingest(IngestRequest {
                team_id: "team".into(),
                trajectory_id: Some("t1".into()),
                name: "run".into(),
                sources: vec![source],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(receipt.total_frames, 2);
        assert_eq!(receipt.total_chunks, 2);
        assert_eq!(receipt.skipped_blocks, 1);
        assert_eq!(queue.queue_length(QueueKind::TrajectoryProcessing).await.unwrap(), 2);
        assert!(dir.path().join("t1/frames/200.lammpstrj").exists());

        let stats = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stats.declared_timesteps.into_iter().collect::<Vec<_>>(), vec![100, 200]);
    }

    #[tokio::test]
    async fn test_dead_lettered_chunks_record_failures() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("upload.dump");
        std::fs::write(&source, DUMP).unwrap();

        let queue = Arc::new(MemoryJobQueue::new());
        let store = Arc::new(MemoryTrajectoryStore::new());
        let ingestor = ingestor(queue.clone(), store.clone(), dir.path());
        ingestor
            .ingest(IngestRequest {
                team_id: "team".into(),
                trajectory_id: Some("t1".into()),
                name: "run".into(),
                sources: vec![source],
                ..Default::default()
            })
            .await
            .unwrap();

        let processor = TrajectoryProcessor::new(
            Arc::new(volterra_trajectory::MemoryFrameStore::new()),
            store.clone(),
            Arc::new(crate::events::NullPublisher),
        );
        let visibility = std::time::Duration::from_secs(60);
        let timeout = JobError::Timeout(1);

        let first = queue
            .dequeue(QueueKind::TrajectoryProcessing, "w", visibility)
            .await
            .unwrap()
            .unwrap();
        processor.on_dead_letter(&first, &timeout).await.unwrap();
        let stats = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stats.failed_frames.len(), 1);
        assert_eq!(stats.completed_chunks.len(), 1);

        assert_eq!(ingestor.retry_failed_frames("t1", None).await.unwrap().retried_frames, 1);
        assert_eq!(ingestor.retry_failed_frames("t1", None).await.unwrap().retried_frames, 0);

        let retry = loop {
            let envelope = queue
                .dequeue(QueueKind::TrajectoryProcessing, "w", visibility)
                .await
                .unwrap()
                .unwrap();
            if matches!(&envelope.payload, JobPayload::TrajectoryProcessing(job) if job.retry) {
                break envelope;
            }
        };
        processor.on_dead_letter(&retry, &timeout).await.unwrap();

        // The frame is failed again and no longer held by a queued retry.
        let stats = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stats.failed_frames.len(), 1);
        assert!(stats.retrying.is_empty());
        assert_eq!(stats.completed_chunks.len(), 1);
        assert_eq!(ingestor.retry_failed_frames("t1", None).await.unwrap().retried_frames, 1);
    }

    #[tokio::test]
    async fn test_empty_upload_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.dump");
        std::fs::write(&source, "no frames here\n").unwrap();

        let err = ingestor(
            Arc::new(MemoryJobQueue::new()),
            Arc::new(MemoryTrajectoryStore::new()),
            dir.path(),
        )
        .ingest(IngestRequest {
            team_id: "team".into(),
            name: "empty".into(),
            sources: vec![source],
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalid_trajectory_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ingestor(
            Arc::new(MemoryJobQueue::new()),
            Arc::new(MemoryTrajectoryStore::new()),
            dir.path(),
        )
        .ingest(IngestRequest {
            team_id: "team".into(),
            trajectory_id: Some("../escape".into()),
            sources: vec![dir.path().join("x")],
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }
}
