//! In-memory stores; each operation runs in one critical section.

use super::{
    Analysis, AnalysisStatus, AnalysisStore, ChunkOutcome, ChunkRecorded, CompletionOutcome,
    FailedFrame, FrameSets, TrajectoryStats, TrajectoryStore,
};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

struct AnalysisEntry {
    analysis: Analysis,
    sets: FrameSets,
}

#[derive(Default)]
struct AnalysisState {
    entries: HashMap<String, AnalysisEntry>,
    claims: HashMap<(String, u64), (String, Instant)>,
}

/// In-memory [`AnalysisStore`].
#[derive(Default)]
pub struct MemoryAnalysisStore {
    state: Mutex<AnalysisState>,
}

impl MemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(analysis_id: &str) -> JobError {
    JobError::NotFound(format!("analysis {analysis_id}"))
}

#[async_trait]
impl AnalysisStore for MemoryAnalysisStore {
    async fn create(&self, analysis: &Analysis, timesteps: &[u64]) -> JobResult<()> {
        let mut analysis = analysis.clone();
        let expected: std::collections::BTreeSet<u64> = timesteps.iter().copied().collect();
        analysis.total_frames = expected.len() as u64;

        let sets = FrameSets {
            pending: expected.clone(),
            expected,
            ..FrameSets::default()
        };
        self.state
            .lock()
            .entries
            .insert(analysis.id.clone(), AnalysisEntry { analysis, sets });
        Ok(())
    }

    async fn get(&self, analysis_id: &str) -> JobResult<Option<Analysis>> {
        Ok(self
            .state
            .lock()
            .entries
            .get(analysis_id)
            .map(|entry| entry.analysis.clone()))
    }

    async fn frame_sets(&self, analysis_id: &str) -> JobResult<Option<FrameSets>> {
        Ok(self
            .state
            .lock()
            .entries
            .get(analysis_id)
            .map(|entry| entry.sets.clone()))
    }

    async fn claim_frame(
        &self,
        analysis_id: &str,
        timestep: u64,
        holder: &str,
        ttl: Duration,
    ) -> JobResult<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        // Expired guards go the way of a Redis key TTL.
        state.claims.retain(|_, (_, expires)| *expires > now);
        let key = (analysis_id.to_string(), timestep);

        let held_elsewhere = state
            .claims
            .get(&key)
            .is_some_and(|(owner, expires)| *expires > now && owner != holder);
        if held_elsewhere {
            return Ok(false);
        }
        state.claims.insert(key, (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_frame(&self, analysis_id: &str, timestep: u64, holder: &str) -> JobResult<()> {
        let mut state = self.state.lock();
        let key = (analysis_id.to_string(), timestep);
        if state.claims.get(&key).is_some_and(|(owner, _)| owner == holder) {
            state.claims.remove(&key);
        }
        Ok(())
    }

    async fn record_completion(&self, analysis_id: &str, timestep: u64) -> JobResult<CompletionOutcome> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(analysis_id) else {
            return Ok(CompletionOutcome::Ignored);
        };
        if entry.analysis.is_cancelled() || !entry.sets.expected.contains(&timestep) {
            return Ok(CompletionOutcome::Ignored);
        }

        entry.sets.failed.remove(&timestep);
        entry.sets.pending.remove(&timestep);
        if !entry.sets.completed.insert(timestep) {
            return Ok(CompletionOutcome::AlreadyCounted);
        }

        let analysis = &mut entry.analysis;
        if analysis.completed_frames < analysis.total_frames {
            analysis.completed_frames += 1;
        }
        let finished = analysis.completed_frames == analysis.total_frames && analysis.finished_at.is_none();
        if finished {
            analysis.finished_at = Some(Utc::now());
            analysis.status = AnalysisStatus::Completed;
            debug!(analysis_id = %analysis_id, "Analysis finished");
        }

        Ok(CompletionOutcome::Recorded {
            completed_frames: analysis.completed_frames,
            total_frames: analysis.total_frames,
            finished,
        })
    }

    async fn record_failure(&self, analysis_id: &str, timestep: u64, error: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(analysis_id) else {
            return Ok(false);
        };
        if entry.analysis.is_cancelled()
            || !entry.sets.expected.contains(&timestep)
            || entry.sets.completed.contains(&timestep)
        {
            return Ok(false);
        }

        entry.sets.pending.remove(&timestep);
        entry.sets.failed.insert(timestep);
        debug!(analysis_id = %analysis_id, timestep, error = %error, "Recorded frame failure");
        Ok(true)
    }

    async fn take_retryable(&self, analysis_id: &str) -> JobResult<Vec<u64>> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(analysis_id)
            .ok_or_else(|| not_found(analysis_id))?;

        let retry: Vec<u64> = entry
            .sets
            .expected
            .iter()
            .filter(|ts| !entry.sets.completed.contains(ts) && !entry.sets.pending.contains(ts))
            .copied()
            .collect();
        entry.sets.pending.extend(retry.iter().copied());
        Ok(retry)
    }

    async fn unmark_pending(&self, analysis_id: &str, timesteps: &[u64]) -> JobResult<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(analysis_id) {
            for timestep in timesteps {
                entry.sets.pending.remove(timestep);
            }
        }
        Ok(())
    }

    async fn cancel(&self, analysis_id: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(analysis_id)
            .ok_or_else(|| not_found(analysis_id))?;
        if entry.analysis.status != AnalysisStatus::Running {
            return Ok(false);
        }
        entry.analysis.status = AnalysisStatus::Cancelled;
        entry.analysis.finished_at.get_or_insert_with(Utc::now);
        Ok(true)
    }
}

/// In-memory [`TrajectoryStore`].
#[derive(Default)]
pub struct MemoryTrajectoryStore {
    trajectories: Mutex<HashMap<String, TrajectoryStats>>,
}

impl MemoryTrajectoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrajectoryStore for MemoryTrajectoryStore {
    async fn register(&self, stats: &TrajectoryStats) -> JobResult<()> {
        self.trajectories
            .lock()
            .insert(stats.trajectory_id.clone(), stats.clone());
        Ok(())
    }

    async fn get(&self, trajectory_id: &str) -> JobResult<Option<TrajectoryStats>> {
        Ok(self.trajectories.lock().get(trajectory_id).cloned())
    }

    async fn record_chunk(&self, trajectory_id: &str, outcome: &ChunkOutcome) -> JobResult<ChunkRecorded> {
        let mut trajectories = self.trajectories.lock();
        let stats = trajectories
            .get_mut(trajectory_id)
            .ok_or_else(|| JobError::NotFound(format!("trajectory {trajectory_id}")))?;
        Ok(stats.apply(outcome))
    }

    async fn failed_frames(&self, trajectory_id: &str) -> JobResult<BTreeMap<u64, FailedFrame>> {
        Ok(self
            .trajectories
            .lock()
            .get(trajectory_id)
            .map(|stats| stats.failed_frames.clone())
            .unwrap_or_default())
    }

    async fn take_retryable_frames(
        &self,
        trajectory_id: &str,
    ) -> JobResult<Option<(TrajectoryStats, BTreeMap<u64, FailedFrame>)>> {
        let mut trajectories = self.trajectories.lock();
        Ok(trajectories.get_mut(trajectory_id).map(|stats| {
            let taken = stats.take_retryable();
            (stats.clone(), taken)
        }))
    }

    async fn release_retry(&self, trajectory_id: &str, timesteps: &[u64]) -> JobResult<()> {
        if let Some(stats) = self.trajectories.lock().get_mut(trajectory_id) {
            stats.release_retry(timesteps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn seeded(frames: u64) -> (MemoryAnalysisStore, Analysis) {
        let store = MemoryAnalysisStore::new();
        let analysis = Analysis::new("team", "t1", "cna", serde_json::json!({}), frames);
        let timesteps: Vec<u64> = (1..=frames).collect();
        store.create(&analysis, &timesteps).await.unwrap();
        (store, analysis)
    }

    #[tokio::test]
    async fn test_completion_counted_once() {
        let (store, analysis) = seeded(2).await;
        let first = store.record_completion(&analysis.id, 1).await.unwrap();
        assert_eq!(
            first,
            CompletionOutcome::Recorded { completed_frames: 1, total_frames: 2, finished: false }
        );
        assert_eq!(
            store.record_completion(&analysis.id, 1).await.unwrap(),
            CompletionOutcome::AlreadyCounted
        );
        assert_eq!(
            store.record_completion(&analysis.id, 99).await.unwrap(),
            CompletionOutcome::Ignored
        );

        let last = store.record_completion(&analysis.id, 2).await.unwrap();
        assert!(matches!(last, CompletionOutcome::Recorded { finished: true, .. }));
        let stored = store.get(&analysis.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnalysisStatus::Completed);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_completions() {
        let (store, analysis) = seeded(50).await;
        let store = Arc::new(store);

        let tasks: Vec<_> = (1..=50u64)
            .map(|ts| {
                let store = store.clone();
                let id = analysis.id.clone();
                tokio::spawn(async move { store.record_completion(&id, ts).await.unwrap() })
            })
            .collect();

        let mut finished = 0;
        for task in tasks {
            if let CompletionOutcome::Recorded { finished: true, .. } = task.await.unwrap() {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
        assert_eq!(store.get(&analysis.id).await.unwrap().unwrap().completed_frames, 50);
    }

    #[tokio::test]
    async fn test_failure_and_retry_sets() {
        let (store, analysis) = seeded(3).await;
        assert!(store.take_retryable(&analysis.id).await.unwrap().is_empty());

        store.record_completion(&analysis.id, 1).await.unwrap();
        assert!(store.record_failure(&analysis.id, 2, "exit 1").await.unwrap());
        assert!(!store.record_failure(&analysis.id, 1, "late").await.unwrap());

        let sets = store.frame_sets(&analysis.id).await.unwrap().unwrap();
        assert_eq!(sets.failed.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(sets.pending.iter().copied().collect::<Vec<_>>(), vec![3]);

        assert_eq!(store.take_retryable(&analysis.id).await.unwrap(), vec![2]);
        assert!(store.take_retryable(&analysis.id).await.unwrap().is_empty());

        store.unmark_pending(&analysis.id, &[2]).await.unwrap();
        assert_eq!(store.take_retryable(&analysis.id).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_frame_guard() {
        let (store, analysis) = seeded(1).await;
        let ttl = Duration::from_secs(60);
        assert!(store.claim_frame(&analysis.id, 1, "w1", ttl).await.unwrap());
        assert!(!store.claim_frame(&analysis.id, 1, "w2", ttl).await.unwrap());
        assert!(store.claim_frame(&analysis.id, 1, "w1", ttl).await.unwrap());

        store.release_frame(&analysis.id, 1, "w2").await.unwrap();
        assert!(!store.claim_frame(&analysis.id, 1, "w2", ttl).await.unwrap());

        store.release_frame(&analysis.id, 1, "w1").await.unwrap();
        assert!(store.claim_frame(&analysis.id, 1, "w2", ttl).await.unwrap());

        // Expired guards can be taken over.
        assert!(store.claim_frame(&analysis.id, 2, "w1", Duration::ZERO).await.unwrap());
        assert!(store.claim_frame(&analysis.id, 2, "w2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_claims_are_pruned() {
        let (store, analysis) = seeded(3).await;
        let ttl = Duration::from_secs(60);
        store.claim_frame(&analysis.id, 1, "w1", Duration::ZERO).await.unwrap();
        store.claim_frame(&analysis.id, 2, "w1", ttl).await.unwrap();
        store.claim_frame(&analysis.id, 3, "w1", ttl).await.unwrap();

        let state = store.state.lock();
        assert_eq!(state.claims.len(), 2);
        assert!(!state.claims.contains_key(&(analysis.id.clone(), 1)));
    }

    #[tokio::test]
    async fn test_cancel_ignores_late_completions() {
        let (store, analysis) = seeded(2).await;
        assert!(store.cancel(&analysis.id).await.unwrap());
        assert!(!store.cancel(&analysis.id).await.unwrap());
        assert_eq!(
            store.record_completion(&analysis.id, 1).await.unwrap(),
            CompletionOutcome::Ignored
        );
        assert!(!store.record_failure(&analysis.id, 2, "x").await.unwrap());
        assert_eq!(store.get(&analysis.id).await.unwrap().unwrap().completed_frames, 0);
    }

    #[tokio::test]
    async fn test_trajectory_chunks_any_order() {
        let store = MemoryTrajectoryStore::new();
        let stats = TrajectoryStats::new("t1", "team", "run", "/tmp/t1", 2, [1, 2, 3, 4].into());
        store.register(&stats).await.unwrap();

        let second = ChunkOutcome { chunk_index: Some(1), persisted: vec![3, 4], files: 2, bytes: 20, ..Default::default() };
        let first = ChunkOutcome { chunk_index: Some(0), persisted: vec![1, 2], files: 2, bytes: 20, ..Default::default() };

        assert!(!store.record_chunk("t1", &second).await.unwrap().completed_now);
        assert!(store.record_chunk("t1", &first).await.unwrap().completed_now);
        assert!(!store.record_chunk("t1", &first).await.unwrap().newly_recorded);

        let stats = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stats.persisted_timesteps.len(), 4);
        assert_eq!(stats.total_size, 40);
        assert!(store.failed_frames("t1").await.unwrap().is_empty());
        assert!(matches!(
            store.record_chunk("missing", &first).await,
            Err(JobError::NotFound(_))
        ));
    }
}
