//! Job envelope and payload definitions.
//!
//! Every queue family shares one [`JobEnvelope`]: identity, team scope,
//! delivery bookkeeping and a [`JobPayload`] variant. Payload field names are
//! camelCase on the wire.

use crate::error::JobResult;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;
use volterra_trajectory::FrameInfo;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The four queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    /// Chunked frame ingestion.
    TrajectoryProcessing,
    /// Per-frame plugin runs.
    AnalysisProcessing,
    /// Per-timestep rendering.
    Rasterizer,
    /// Remote trajectory import.
    SshImport,
}

impl QueueKind {
    /// All queue kinds.
    pub const ALL: [QueueKind; 4] = [
        QueueKind::TrajectoryProcessing,
        QueueKind::AnalysisProcessing,
        QueueKind::Rasterizer,
        QueueKind::SshImport,
    ];

    /// Stable queue name used in keys, metrics and updates.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::TrajectoryProcessing => "trajectory-processing",
            QueueKind::AnalysisProcessing => "analysis-processing",
            QueueKind::Rasterizer => "rasterizer",
            QueueKind::SshImport => "ssh-import",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame's raw text on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameFile {
    /// Header summary from the splitter.
    pub frame_info: FrameInfo,

    /// Path of the single-frame dump.
    pub frame_file_path: PathBuf,

    /// File size in bytes.
    #[serde(default)]
    pub size_bytes: u64,
}

/// Chunk of frames to decode and persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryProcessingJob {
    pub trajectory_id: String,
    pub trajectory_name: String,
    /// First timestep of the chunk.
    pub timestep: u64,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    /// Single-frame form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FrameFile>,
    #[serde(default)]
    pub files: Vec<FrameFile>,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Re-processing of failed frames; does not count toward chunk completion.
    #[serde(default)]
    pub retry: bool,
}

impl TrajectoryProcessingJob {
    /// All frame files carried by the job, single-frame form included.
    pub fn frames(&self) -> Vec<FrameFile> {
        self.file
            .iter()
            .chain(self.files.iter())
            .cloned()
            .collect()
    }
}

/// One plugin run over one timestep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub trajectory_id: String,
    pub folder_path: PathBuf,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Where the frame is materialised as dump text.
    pub input_file: PathBuf,
    pub analysis_id: String,
    /// `<plugin>:<analysisId>`, used to name plugin outputs.
    pub analysis_key: String,
    pub plugin: String,
    #[serde(default)]
    pub session_start_time: Option<DateTime<Utc>>,
    pub timestep: u64,
}

/// One rendering of one timestep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterizerJob {
    pub trajectory_id: String,
    pub folder_path: PathBuf,
    #[serde(default)]
    pub opts: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub session_start_time: Option<DateTime<Utc>>,
    pub timestep: u64,
}

/// Import of a trajectory over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshImportJob {
    pub ssh_connection_id: String,
    pub remote_path: String,
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
}

/// Job-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queueType", rename_all = "kebab-case")]
pub enum JobPayload {
    TrajectoryProcessing(TrajectoryProcessingJob),
    AnalysisProcessing(AnalysisJob),
    Rasterizer(RasterizerJob),
    SshImport(SshImportJob),
}

impl JobPayload {
    /// Queue family this payload belongs to.
    pub fn kind(&self) -> QueueKind {
        match self {
            JobPayload::TrajectoryProcessing(_) => QueueKind::TrajectoryProcessing,
            JobPayload::AnalysisProcessing(_) => QueueKind::AnalysisProcessing,
            JobPayload::Rasterizer(_) => QueueKind::Rasterizer,
            JobPayload::SshImport(_) => QueueKind::SshImport,
        }
    }

    /// Trajectory the job works on, if any.
    pub fn trajectory_id(&self) -> Option<&str> {
        match self {
            JobPayload::TrajectoryProcessing(job) => Some(&job.trajectory_id),
            JobPayload::AnalysisProcessing(job) => Some(&job.trajectory_id),
            JobPayload::Rasterizer(job) => Some(&job.trajectory_id),
            JobPayload::SshImport(_) => None,
        }
    }

    /// Timestep the job works on, if any.
    pub fn timestep(&self) -> Option<u64> {
        match self {
            JobPayload::TrajectoryProcessing(job) => Some(job.timestep),
            JobPayload::AnalysisProcessing(job) => Some(job.timestep),
            JobPayload::Rasterizer(job) => Some(job.timestep),
            JobPayload::SshImport(_) => None,
        }
    }
}

/// Serialized job stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    /// Job ID.
    pub job_id: JobId,

    /// Team that receives this job's updates.
    pub team_id: String,

    /// Originating client session.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Job payload.
    pub payload: JobPayload,

    /// Attempts made so far.
    pub attempt: u32,

    /// Maximum attempts.
    pub max_attempts: u32,

    /// Priority (higher = more urgent).
    #[serde(default)]
    pub priority: i8,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job becomes ready.
    pub scheduled_at: DateTime<Utc>,

    /// Error from the last failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,

    /// Retry policy applied by `JobQueue::fail`.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl JobEnvelope {
    /// Creates an envelope with the default retry policy.
    pub fn new(team_id: impl Into<String>, payload: JobPayload) -> Self {
        let now = Utc::now();
        let retry_policy = RetryPolicy::default();
        Self {
            job_id: JobId::new(),
            team_id: team_id.into(),
            session_id: None,
            payload,
            attempt: 0,
            max_attempts: retry_policy.max_retries + 1,
            priority: 0,
            created_at: now,
            scheduled_at: now,
            last_error: None,
            retry_policy,
        }
    }

    /// Sets the originating session.
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.max_attempts = policy.max_retries + 1;
        self.retry_policy = policy;
        self
    }

    /// Queue family of the payload.
    pub fn kind(&self) -> QueueKind {
        self.payload.kind()
    }

    /// Create job context for execution.
    pub fn to_context(&self, worker_id: &str) -> JobContext {
        JobContext {
            job_id: self.job_id.clone(),
            team_id: self.team_id.clone(),
            session_id: self.session_id.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            queue: self.kind(),
            scheduled_at: self.scheduled_at,
            started_at: Utc::now(),
            worker_id: worker_id.to_string(),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Job execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Team scope.
    pub team_id: String,

    /// Originating session.
    pub session_id: Option<String>,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum attempts allowed.
    pub max_attempts: u32,

    /// Queue family.
    pub queue: QueueKind,

    /// Job was scheduled at this time.
    pub scheduled_at: DateTime<Utc>,

    /// Job started executing at this time.
    pub started_at: DateTime<Utc>,

    /// Worker ID processing this job.
    pub worker_id: String,
}

impl JobContext {
    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
