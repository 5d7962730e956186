//! Pipeline assembly and lifecycle.

use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use volterra_config::AppConfig;
use volterra_jobs::{
    create_pool, AnalysisProcessor, AnalysisScheduler, AnalysisStore, CommandRunner, EventPublisher,
    EventSubscriber, JobHandler, JobProducer, JobQueue, JobResult, JobsConfig, LocalEventBus,
    MemoryAnalysisStore, MemoryJobQueue, MemoryTrajectoryStore, PluginRegistry, ProcessRunner,
    RasterizerProcessor, RedisAnalysisStore, RedisEventBus, RedisJobQueue, RedisTrajectoryStore,
    ScpFetcher, SshImportProcessor, StaticConnectionDirectory, TeamBroadcaster, TrajectoryIngestor,
    TrajectoryProcessor, TrajectoryStore, WorkerPool, WorkerPoolConfig,
};
use volterra_trajectory::{FrameStore, FsFrameStore};

/// Queue, stores and event bus the pipeline runs on.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub analyses: Arc<dyn AnalysisStore>,
    pub trajectories: Arc<dyn TrajectoryStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub subscriber: Arc<dyn EventSubscriber>,
}

impl Backends {
    /// Shared Redis backends for a multi-process deployment.
    pub async fn redis(config: &JobsConfig) -> anyhow::Result<Self> {
        let pool = create_pool(&config.redis)
            .await
            .context("failed to connect to Redis")?;
        let bus = Arc::new(RedisEventBus::new(
            pool.clone(),
            &config.redis.url,
            config.events.channel.clone(),
        )?);

        Ok(Self {
            queue: Arc::new(RedisJobQueue::new(pool.clone(), config)),
            analyses: Arc::new(RedisAnalysisStore::new(pool.clone(), config.redis.key_prefix.clone())),
            trajectories: Arc::new(RedisTrajectoryStore::new(pool, config.redis.key_prefix.clone())),
            publisher: bus.clone(),
            subscriber: bus,
        })
    }

    /// Process-local backends; nothing survives a restart.
    pub fn in_memory(config: &JobsConfig) -> Self {
        let bus = Arc::new(LocalEventBus::new(config.events.local_capacity));
        Self {
            queue: Arc::new(MemoryJobQueue::new().with_completion_ttl(config.queue.completion_ttl())),
            analyses: Arc::new(MemoryAnalysisStore::new()),
            trajectories: Arc::new(MemoryTrajectoryStore::new()),
            publisher: bus.clone(),
            subscriber: bus,
        }
    }
}

/// The assembled pipeline: producers for callers, one worker pool per queue
/// and the team update relay.
pub struct App {
    backends: Backends,
    ingestor: TrajectoryIngestor,
    scheduler: AnalysisScheduler,
    broadcaster: TeamBroadcaster,
    pools: Vec<WorkerPool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl App {
    /// Builds every component from `config` over `backends`.
    pub fn build(config: &AppConfig, backends: Backends) -> Self {
        let jobs = &config.jobs;
        let registry = Arc::new(PluginRegistry::from_config(&config.plugins));
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        let frames: Arc<dyn FrameStore> = Arc::new(FsFrameStore::new(&config.storage.frames_root));

        let producer = JobProducer::new(backends.queue.clone(), &jobs.producer);
        let ingestor = TrajectoryIngestor::new(
            producer.clone(),
            backends.trajectories.clone(),
            &config.storage.trajectories_root,
            jobs.ingest.chunk_size,
        );
        let scheduler = AnalysisScheduler::new(
            producer,
            backends.analyses.clone(),
            backends.trajectories.clone(),
            registry.clone(),
        )
        .with_retry_policy(jobs.queue.default_retry.policy());

        let directory = config
            .ssh
            .targets
            .iter()
            .fold(StaticConnectionDirectory::new(), |dir, target| {
                dir.with(target.owner.clone(), target.connection.clone())
            });

        let pool_config = WorkerPoolConfig::from(&jobs.worker);
        let pool = |handler: Arc<dyn JobHandler>| {
            WorkerPool::new(
                backends.queue.clone(),
                handler,
                backends.publisher.clone(),
                pool_config.clone(),
            )
        };

        let pools = vec![
            pool(Arc::new(TrajectoryProcessor::new(
                frames.clone(),
                backends.trajectories.clone(),
                backends.publisher.clone(),
            ))),
            pool(Arc::new(AnalysisProcessor::new(
                frames.clone(),
                backends.analyses.clone(),
                registry.clone(),
                runner.clone(),
                backends.publisher.clone(),
            ))),
            pool(Arc::new(RasterizerProcessor::new(
                frames,
                registry.clone(),
                runner.clone(),
            ))),
            pool(Arc::new(SshImportProcessor::new(
                Arc::new(directory),
                Arc::new(ScpFetcher::new(runner, registry.scp_path())),
                ingestor.clone(),
                &config.storage.staging_root,
            ))),
        ];

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            broadcaster: TeamBroadcaster::new(jobs.events.pending_buffer_capacity),
            backends,
            ingestor,
            scheduler,
            pools,
            shutdown_tx,
        }
    }

    pub fn ingestor(&self) -> &TrajectoryIngestor {
        &self.ingestor
    }

    pub fn scheduler(&self) -> &AnalysisScheduler {
        &self.scheduler
    }

    /// Client registry fed by the update relay.
    pub fn broadcaster(&self) -> &TeamBroadcaster {
        &self.broadcaster
    }

    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    /// Runs every worker pool and the relay until `shutdown` resolves, then
    /// stops them and waits for in-flight jobs.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        self.backends
            .queue
            .health_check()
            .await
            .context("job queue health check failed")?;

        let mut handles: Vec<(String, JoinHandle<JobResult<()>>)> = Vec::new();
        for pool in &self.pools {
            let worker = pool.clone();
            handles.push((pool.id().to_string(), tokio::spawn(async move { worker.start().await })));
        }

        let relay = {
            let broadcaster = self.broadcaster.clone();
            let subscriber = self.backends.subscriber.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move { broadcaster.run(subscriber, shutdown_rx).await })
        };
        handles.push(("team-broadcaster".to_string(), relay));

        info!(pools = self.pools.len(), "Pipeline running");
        shutdown.await;
        info!("Stopping worker pools...");

        for pool in &self.pools {
            pool.stop();
        }
        if self.shutdown_tx.send(()).is_err() {
            warn!("Update relay already stopped");
        }

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = %name, error = %e, "Task finished with error"),
                Err(e) => error!(task = %name, error = %e, "Task panicked"),
            }
        }

        for pool in &self.pools {
            let stats = pool.stats();
            info!(
                pool_id = %pool.id(),
                processed = stats.jobs_processed,
                failed = stats.jobs_failed,
                "Worker pool stopped"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use volterra_jobs::IngestRequest;

    fn dump(timesteps: &[u64]) -> String {
        timesteps
            .iter()
            .map(|ts| {
                format!(
                    "ITEM: TIMESTEP\n{ts}\nITEM: NUMBER OF ATOMS\n1\nITEM: BOX BOUNDS pp pp pp\n\
                     0.0 1.0\n0.0 1.0\n0.0 1.0\nITEM: ATOMS id type x y z\n1 1 0.5 0.5 0.5\n"
                )
            })
            .collect()
    }

    fn test_config(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.trajectories_root = root.join("trajectories");
        config.storage.frames_root = root.join("frames");
        config.storage.staging_root = root.join("staging");
        config.jobs.worker.concurrency = 2;
        config.jobs.worker.poll_interval_ms = 5;
        config.jobs.worker.shutdown_timeout_secs = 2;
        config.jobs.ingest.chunk_size = 2;
        config
    }

    #[test]
    fn test_build_creates_one_pool_per_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let app = App::build(&config, Backends::in_memory(&config.jobs));

        let ids: Vec<&str> = app.pools().iter().map(WorkerPool::id).collect();
        assert_eq!(ids.len(), 4);
        for prefix in ["trajectory", "analysis", "rasterizer", "ssh"] {
            assert!(ids.iter().any(|id| id.contains(prefix)), "missing {prefix} pool in {ids:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_processes_ingest_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let backends = Backends::in_memory(&config.jobs);
        let trajectories = backends.trajectories.clone();
        let app = App::build(&config, backends);
        let ingestor = app.ingestor().clone();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(app.run(async {
            let _ = stop_rx.await;
        }));

        let source = dir.path().join("upload.dump");
        std::fs::write(&source, dump(&[0, 10, 20])).unwrap();
        let receipt = ingestor
            .ingest(IngestRequest {
                team_id: "team-1".into(),
                name: "run".into(),
                sources: vec![source],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(receipt.total_chunks, 2);

        let complete = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let stats = trajectories.get(&receipt.trajectory_id).await.unwrap();
                if stats.is_some_and(|s| s.is_complete()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(complete.is_ok(), "trajectory never completed");

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
