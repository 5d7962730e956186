//! Analysis and trajectory progress stores.
//!
//! Counters in these stores are the only ordering-independent record of
//! progress, so every mutation is a single atomic operation on the backend:
//! a Lua script on Redis, one critical section in memory. Callers never
//! read, modify and write back.

mod memory;

pub use memory::{MemoryAnalysisStore, MemoryTrajectoryStore};

use crate::error::JobResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Analysis lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Running,
    Completed,
    Cancelled,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Running => "running",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(AnalysisStatus::Running),
            "completed" => Some(AnalysisStatus::Completed),
            "cancelled" => Some(AnalysisStatus::Cancelled),
            _ => None,
        }
    }
}

/// One plugin applied across some or all frames of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub id: String,
    pub team_id: String,
    pub plugin: String,
    pub trajectory_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub total_frames: u64,
    pub completed_frames: u64,
    pub status: AnalysisStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Analysis {
    /// New running analysis with a time-ordered id.
    pub fn new(
        team_id: impl Into<String>,
        trajectory_id: impl Into<String>,
        plugin: impl Into<String>,
        config: serde_json::Value,
        total_frames: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7().simple().to_string(),
            team_id: team_id.into(),
            plugin: plugin.into(),
            trajectory_id: trajectory_id.into(),
            config,
            total_frames,
            completed_frames: 0,
            status: AnalysisStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// `<plugin>:<id>`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.plugin, self.id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == AnalysisStatus::Cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Per-timestep bookkeeping of an analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSets {
    pub expected: BTreeSet<u64>,
    pub completed: BTreeSet<u64>,
    pub failed: BTreeSet<u64>,
    /// Enqueued and not yet settled.
    pub pending: BTreeSet<u64>,
}

/// Result of [`AnalysisStore::record_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Counter incremented.
    Recorded {
        completed_frames: u64,
        total_frames: u64,
        /// This completion was the one that reached `total_frames`.
        finished: bool,
    },
    /// The timestep had already been counted.
    AlreadyCounted,
    /// Cancelled analysis, unknown analysis or unexpected timestep.
    Ignored,
}

/// Persisted analysis aggregate.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Stores a new analysis expecting `timesteps`, all marked pending.
    async fn create(&self, analysis: &Analysis, timesteps: &[u64]) -> JobResult<()>;

    async fn get(&self, analysis_id: &str) -> JobResult<Option<Analysis>>;

    async fn frame_sets(&self, analysis_id: &str) -> JobResult<Option<FrameSets>>;

    /// Takes the in-flight guard for one timestep. Returns false if held by
    /// another holder.
    async fn claim_frame(
        &self,
        analysis_id: &str,
        timestep: u64,
        holder: &str,
        ttl: Duration,
    ) -> JobResult<bool>;

    /// Releases the guard if `holder` still owns it.
    async fn release_frame(&self, analysis_id: &str, timestep: u64, holder: &str) -> JobResult<()>;

    /// Counts a timestep complete exactly once; sets `finished_at` when the
    /// last expected timestep lands.
    async fn record_completion(&self, analysis_id: &str, timestep: u64) -> JobResult<CompletionOutcome>;

    /// Marks a timestep failed unless it already completed. Returns true if recorded.
    async fn record_failure(&self, analysis_id: &str, timestep: u64, error: &str) -> JobResult<bool>;

    /// Moves `expected - completed - pending` into pending and returns it sorted.
    async fn take_retryable(&self, analysis_id: &str) -> JobResult<Vec<u64>>;

    /// Clears pending marks after a failed enqueue.
    async fn unmark_pending(&self, analysis_id: &str, timesteps: &[u64]) -> JobResult<()>;

    /// Cancels a running analysis. Returns false if it was not running.
    async fn cancel(&self, analysis_id: &str) -> JobResult<bool>;
}

/// A frame that could not be decoded or persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedFrame {
    pub frame_file_path: PathBuf,
    #[serde(default)]
    pub atom_count: u64,
    pub error: String,
}

/// Ingestion progress of one trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryStats {
    pub trajectory_id: String,
    pub team_id: String,
    pub name: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub folder_path: PathBuf,
    pub total_chunks: u32,
    #[serde(default)]
    pub completed_chunks: BTreeSet<u32>,
    pub declared_timesteps: BTreeSet<u64>,
    #[serde(default)]
    pub persisted_timesteps: BTreeSet<u64>,
    #[serde(default)]
    pub failed_frames: BTreeMap<u64, FailedFrame>,
    /// Failed timesteps sitting in a queued retry chunk.
    #[serde(default)]
    pub retrying: BTreeSet<u64>,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrajectoryStats {
    pub fn new(
        trajectory_id: impl Into<String>,
        team_id: impl Into<String>,
        name: impl Into<String>,
        folder_path: impl Into<PathBuf>,
        total_chunks: u32,
        declared_timesteps: BTreeSet<u64>,
    ) -> Self {
        Self {
            trajectory_id: trajectory_id.into(),
            team_id: team_id.into(),
            name: name.into(),
            folder_id: None,
            folder_path: folder_path.into(),
            total_chunks,
            completed_chunks: BTreeSet::new(),
            declared_timesteps,
            persisted_timesteps: BTreeSet::new(),
            failed_frames: BTreeMap::new(),
            retrying: BTreeSet::new(),
            total_files: 0,
            total_size: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Failed timesteps in ascending order.
    pub fn failed_timesteps(&self) -> Vec<u64> {
        self.failed_frames.keys().copied().collect()
    }

    /// Marks the failed frames not already out for retry as retrying and returns them.
    pub(crate) fn take_retryable(&mut self) -> BTreeMap<u64, FailedFrame> {
        let taken: BTreeMap<u64, FailedFrame> = self
            .failed_frames
            .iter()
            .filter(|(timestep, _)| !self.retrying.contains(timestep))
            .map(|(timestep, failed)| (*timestep, failed.clone()))
            .collect();
        self.retrying.extend(taken.keys().copied());
        taken
    }

    /// Returns timesteps of a retry chunk that was never queued. True if any were held.
    pub(crate) fn release_retry(&mut self, timesteps: &[u64]) -> bool {
        timesteps
            .iter()
            .fold(false, |released, ts| self.retrying.remove(ts) || released)
    }

    /// Applies a chunk outcome. Shared by every backend so the rules live in one place.
    pub(crate) fn apply(&mut self, outcome: &ChunkOutcome) -> ChunkRecorded {
        if let Some(index) = outcome.chunk_index {
            if self.completed_chunks.contains(&index) {
                return ChunkRecorded::default();
            }
        }

        for timestep in &outcome.persisted {
            self.persisted_timesteps.insert(*timestep);
            self.failed_frames.remove(timestep);
            self.retrying.remove(timestep);
        }
        for (timestep, failure) in &outcome.failed {
            self.retrying.remove(timestep);
            if !self.persisted_timesteps.contains(timestep) {
                self.failed_frames.insert(*timestep, failure.clone());
            }
        }

        let mut completed_now = false;
        if let Some(index) = outcome.chunk_index {
            self.completed_chunks.insert(index);
            self.total_files += outcome.files;
            self.total_size += outcome.bytes;
            if self.completed_chunks.len() as u32 >= self.total_chunks && self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
                completed_now = true;
            }
        }

        ChunkRecorded {
            newly_recorded: true,
            completed_now,
        }
    }
}

/// Outcome of processing one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOutcome {
    /// `None` for a retry chunk, which does not count toward completion.
    pub chunk_index: Option<u32>,
    pub persisted: Vec<u64>,
    pub failed: BTreeMap<u64, FailedFrame>,
    pub files: u64,
    pub bytes: u64,
}

/// Result of [`TrajectoryStore::record_chunk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkRecorded {
    /// False when the chunk index had already been recorded.
    pub newly_recorded: bool,
    /// This chunk was the first to complete the trajectory.
    pub completed_now: bool,
}

/// Persisted trajectory ingestion progress.
#[async_trait]
pub trait TrajectoryStore: Send + Sync {
    async fn register(&self, stats: &TrajectoryStats) -> JobResult<()>;

    async fn get(&self, trajectory_id: &str) -> JobResult<Option<TrajectoryStats>>;

    /// Applies a chunk outcome atomically and at most once per chunk index.
    async fn record_chunk(&self, trajectory_id: &str, outcome: &ChunkOutcome) -> JobResult<ChunkRecorded>;

    async fn failed_frames(&self, trajectory_id: &str) -> JobResult<BTreeMap<u64, FailedFrame>>;

    /// Atomically marks the failed frames not already queued for retry as
    /// retrying. Returns the updated stats and the frames taken, or `None`
    /// for an unknown trajectory.
    ///
    /// Marks clear when a chunk outcome mentions the timestep again.
    async fn take_retryable_frames(
        &self,
        trajectory_id: &str,
    ) -> JobResult<Option<(TrajectoryStats, BTreeMap<u64, FailedFrame>)>>;

    /// Clears retrying marks for a retry chunk that could not be queued.
    async fn release_retry(&self, trajectory_id: &str, timesteps: &[u64]) -> JobResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(path: &str) -> FailedFrame {
        FailedFrame {
            frame_file_path: path.into(),
            atom_count: 4,
            error: "bad".into(),
        }
    }

    fn stats() -> TrajectoryStats {
        TrajectoryStats::new("t1", "team", "run", "/tmp/t1", 2, [1, 2, 3].into())
    }

    #[test]
    fn test_apply_is_idempotent_per_chunk() {
        let mut stats = stats();
        let outcome = ChunkOutcome {
            chunk_index: Some(0),
            persisted: vec![1, 2],
            files: 2,
            bytes: 100,
            ..Default::default()
        };
        assert!(stats.apply(&outcome).newly_recorded);
        assert!(!stats.apply(&outcome).newly_recorded);
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_size, 100);
    }

    #[test]
    fn test_completion_once() {
        let mut stats = stats();
        let first = stats.apply(&ChunkOutcome {
            chunk_index: Some(1),
            failed: [(3, failed("/tmp/t1/3"))].into(),
            files: 1,
            ..Default::default()
        });
        assert!(!first.completed_now);

        let last = stats.apply(&ChunkOutcome {
            chunk_index: Some(0),
            persisted: vec![1, 2],
            files: 2,
            ..Default::default()
        });
        assert!(last.completed_now);
        assert_eq!(stats.failed_timesteps(), vec![3]);

        let retry = stats.apply(&ChunkOutcome {
            chunk_index: None,
            persisted: vec![3],
            ..Default::default()
        });
        assert!(retry.newly_recorded && !retry.completed_now);
        assert!(stats.failed_frames.is_empty());
        assert_eq!(stats.total_files, 3);
    }

    #[test]
    fn test_failure_never_overrides_persisted() {
        let mut stats = stats();
        stats.apply(&ChunkOutcome {
            chunk_index: None,
            persisted: vec![2],
            ..Default::default()
        });
        stats.apply(&ChunkOutcome {
            chunk_index: None,
            failed: [(2, failed("/tmp/t1/2"))].into(),
            ..Default::default()
        });
        assert!(stats.failed_frames.is_empty());
    }

    #[test]
    fn test_retrying_frames_are_taken_once() {
        let mut stats = stats();
        stats.apply(&ChunkOutcome {
            chunk_index: Some(0),
            failed: [(1, failed("/tmp/t1/1")), (2, failed("/tmp/t1/2"))].into(),
            ..Default::default()
        });

        assert_eq!(stats.take_retryable().keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert!(stats.take_retryable().is_empty());

        // The retry chunk fails 2 again, which makes it retryable once more.
        stats.apply(&ChunkOutcome {
            chunk_index: None,
            persisted: vec![1],
            failed: [(2, failed("/tmp/t1/2"))].into(),
            ..Default::default()
        });
        assert!(stats.retrying.is_empty());
        assert_eq!(stats.take_retryable().keys().copied().collect::<Vec<_>>(), vec![2]);

        assert!(stats.release_retry(&[2]));
        assert!(!stats.release_retry(&[2]));
        assert_eq!(stats.take_retryable().len(), 1);
    }

    #[test]
    fn test_analysis_key_and_status() {
        let analysis = Analysis::new("team", "t1", "cna", serde_json::json!({}), 10);
        assert_eq!(analysis.key(), format!("cna:{}", analysis.id));
        assert_eq!(AnalysisStatus::parse("cancelled"), Some(AnalysisStatus::Cancelled));
        assert_eq!(serde_json::to_value(analysis.status).unwrap(), "running");
    }
}
