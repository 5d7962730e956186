//! Shared fixtures for pipeline integration tests.
//!
//! Everything runs on the in-memory backends; plugins are replaced by a
//! scripted [`CommandRunner`] that fails chosen timesteps.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use volterra_jobs::{
    AnalysisProcessor, AnalysisScheduler, CommandOutput, CommandRunner, IngestRequest, JobProducer,
    JobResult, LocalEventBus, MemoryAnalysisStore, MemoryJobQueue, MemoryTrajectoryStore,
    PluginRegistry, ProducerConfig, TrajectoryIngestor, TrajectoryProcessor, WorkerPool,
    WorkerPoolConfig,
};
use volterra_trajectory::MemoryFrameStore;

pub const TEAM: &str = "team-1";
pub const PLUGIN: &str = "cna";

/// One LAMMPS dump frame with two atoms; `valid = false` corrupts a coordinate.
pub fn frame_text(timestep: u64, valid: bool) -> String {
    let x = if valid { "0.5" } else { "abc" };
    format!(
        "ITEM: TIMESTEP\n{timestep}\nITEM: NUMBER OF ATOMS\n2\nITEM: BOX BOUNDS pp pp pp\n\
         0.0 10.0\n0.0 10.0\n0.0 10.0\nITEM: ATOMS id type x y z\n1 1 {x} 0.5 0.5\n2 1 1.5 1.5 1.5\n"
    )
}

/// Writes a dump holding `timesteps`, corrupting those listed in `broken`.
pub fn write_dump(dir: &Path, name: &str, timesteps: &[u64], broken: &[u64]) -> PathBuf {
    let text: String = timesteps
        .iter()
        .map(|ts| frame_text(*ts, !broken.contains(ts)))
        .collect();
    let path = dir.join(name);
    std::fs::write(&path, text).expect("write dump");
    path
}

/// Stand-in for plugin executables: exits 1 for timesteps in the fail set.
#[derive(Default)]
pub struct ScriptedRunner {
    failing: Mutex<HashSet<u64>>,
    calls: Mutex<Vec<u64>>,
}

impl ScriptedRunner {
    pub fn failing(timesteps: &[u64]) -> Self {
        Self {
            failing: Mutex::new(timesteps.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Lets every timestep succeed from now on.
    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, _command: &Path, args: &[String], _cwd: &Path) -> JobResult<CommandOutput> {
        let timestep = args
            .iter()
            .position(|arg| arg == "--timestep")
            .and_then(|i| args.get(i + 1))
            .and_then(|ts| ts.parse::<u64>().ok())
            .unwrap_or_default();
        self.calls.lock().push(timestep);

        if self.failing.lock().contains(&timestep) {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("segfault at timestep {timestep}\n"),
            });
        }
        Ok(CommandOutput {
            code: Some(0),
            stdout: format!("{{\"timestep\": {timestep}}}"),
            stderr: String::new(),
        })
    }
}

pub fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency: 4,
        job_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(2),
        shutdown_timeout: Duration::from_secs(2),
        visibility_timeout: Duration::from_secs(60),
        recovery_interval: Duration::from_millis(20),
    }
}

/// The whole pipeline wired on in-memory backends.
pub struct Pipeline {
    pub dir: TempDir,
    pub queue: Arc<MemoryJobQueue>,
    pub analyses: Arc<MemoryAnalysisStore>,
    pub trajectories: Arc<MemoryTrajectoryStore>,
    pub frames: Arc<MemoryFrameStore>,
    pub bus: Arc<LocalEventBus>,
    pub runner: Arc<ScriptedRunner>,
    pub ingestor: TrajectoryIngestor,
    pub scheduler: AnalysisScheduler,
    pub trajectory_pool: WorkerPool,
    pub analysis_pool: WorkerPool,
}

impl Pipeline {
    pub fn new(runner: ScriptedRunner, chunk_size: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(MemoryJobQueue::new());
        let analyses = Arc::new(MemoryAnalysisStore::new());
        let trajectories = Arc::new(MemoryTrajectoryStore::new());
        let frames = Arc::new(MemoryFrameStore::new());
        let bus = Arc::new(LocalEventBus::new(4096));
        let runner = Arc::new(runner);
        let registry = Arc::new(PluginRegistry::default().with_plugin(PLUGIN, "/opt/plugins/cna"));

        let producer = JobProducer::new(queue.clone(), &ProducerConfig::default());
        let ingestor = TrajectoryIngestor::new(
            producer.clone(),
            trajectories.clone(),
            dir.path().join("trajectories"),
            chunk_size,
        );
        let scheduler = AnalysisScheduler::new(
            producer,
            analyses.clone(),
            trajectories.clone(),
            registry.clone(),
        );

        let trajectory_pool = WorkerPool::new(
            queue.clone(),
            Arc::new(TrajectoryProcessor::new(
                frames.clone(),
                trajectories.clone(),
                bus.clone(),
            )),
            bus.clone(),
            pool_config(),
        );
        let analysis_pool = WorkerPool::new(
            queue.clone(),
            Arc::new(AnalysisProcessor::new(
                frames.clone(),
                analyses.clone(),
                registry,
                runner.clone(),
                bus.clone(),
            )),
            bus.clone(),
            pool_config(),
        );

        Self {
            dir,
            queue,
            analyses,
            trajectories,
            frames,
            bus,
            runner,
            ingestor,
            scheduler,
            trajectory_pool,
            analysis_pool,
        }
    }

    pub fn upload_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("uploads");
        std::fs::create_dir_all(&dir).expect("upload dir");
        dir
    }

    /// Ingests `timesteps` and processes every chunk job. Returns the trajectory id.
    pub async fn ingest(&self, trajectory_id: &str, timesteps: &[u64], broken: &[u64]) -> String {
        let dump = write_dump(&self.upload_dir(), &format!("{trajectory_id}.dump"), timesteps, broken);
        let receipt = self
            .ingestor
            .ingest(IngestRequest {
                team_id: TEAM.into(),
                trajectory_id: Some(trajectory_id.into()),
                name: format!("{trajectory_id} run"),
                sources: vec![dump],
                ..Default::default()
            })
            .await
            .expect("ingest");
        self.trajectory_pool.drain().await.expect("drain chunks");
        receipt.trajectory_id
    }
}
