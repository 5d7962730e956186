//! Volterra Jobs - distributed processing pipeline
//!
//! Trajectory ingestion, per-frame analysis, rasterization and remote import
//! run as jobs on four queues sharing one envelope format:
//! - At-least-once delivery with claim deadlines and completion markers
//! - Retry policies with exponential backoff and a dead letter queue
//! - Worker pools with bounded concurrency and graceful shutdown
//! - Atomic progress stores for analyses and trajectory chunks
//! - Team-scoped update fan-out to connected clients
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  Ingestor / AnalysisScheduler / enqueue_rasterization          │
//! │                    │  JobProducer (retry on enqueue)           │
//! │                    ▼                                           │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │ JobQueue (Redis or memory)                               │  │
//! │  │  pqueue ──claim──▶ active ──complete──▶ done marker      │  │
//! │  │    ▲                  │                                  │  │
//! │  │    └──── delayed ◀────┴──fail──▶ dead letter queue       │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! │                    │                                           │
//! │                    ▼                                           │
//! │  WorkerPool ──▶ JobHandler ──▶ AnalysisStore / TrajectoryStore │
//! │       │                                                        │
//! │       └──▶ EventPublisher ──▶ TeamBroadcaster ──▶ clients      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use volterra_jobs::prelude::*;
//!
//! let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
//! let producer = JobProducer::new(queue.clone(), &ProducerConfig::default());
//! let scheduler = AnalysisScheduler::new(producer, analyses, trajectories, registry);
//!
//! let receipt = scheduler
//!     .submit(AnalysisRequest {
//!         team_id: "team-1".into(),
//!         trajectory_id: trajectory_id.clone(),
//!         plugin: "cna".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("analysis {} over {} frames", receipt.analysis_id, receipt.total_frames);
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod plugin;
pub mod producer;
pub mod queue;
pub mod queues;
pub mod redis;
pub mod retry;
pub mod store;
pub mod worker;

pub use config::{
    EventsConfig, IngestConfig, JobsConfig, ProducerConfig, QueueConfig, RedisConfig, WorkerConfig,
};
pub use error::{JobError, JobResult};
pub use events::{
    publish_quietly, ClientEvent, EventPublisher, EventSubscriber, JobUpdate, JobUpdateEnvelope,
    LocalEventBus, NullPublisher, TeamBroadcaster, UpdateStatus,
};
pub use job::{
    AnalysisJob, FrameFile, JobContext, JobEnvelope, JobId, JobPayload, QueueKind, RasterizerJob,
    SshImportJob, TrajectoryProcessingJob,
};
pub use memory::MemoryJobQueue;
pub use metrics::{register_metrics, EventMetrics, JobMetrics, PipelineMetrics, WorkerMetrics};
pub use plugin::{CommandOutput, CommandRunner, PluginRegistry, PluginsConfig, ProcessRunner};
pub use producer::JobProducer;
pub use queue::{FailOutcome, JobQueue, QueueStats};
pub use queues::{
    enqueue_rasterization, AnalysisProcessor, AnalysisReceipt, AnalysisRequest, AnalysisScheduler,
    FrameRetrySummary, IngestReceipt, IngestRequest, RasterizeRequest, RasterizerProcessor,
    RetrySummary, ScpFetcher, SshConnection, SshImportProcessor, StaticConnectionDirectory,
    TrajectoryIngestor, TrajectoryProcessor,
};
pub use crate::redis::{create_pool, RedisAnalysisStore, RedisEventBus, RedisJobQueue, RedisTrajectoryStore};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::{
    Analysis, AnalysisStatus, AnalysisStore, ChunkOutcome, ChunkRecorded, CompletionOutcome,
    FailedFrame, FrameSets, MemoryAnalysisStore, MemoryTrajectoryStore, TrajectoryStats,
    TrajectoryStore,
};
pub use worker::{JobHandler, JobOutcome, ProcessedJob, WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::config::{JobsConfig, ProducerConfig};
    pub use crate::events::{EventPublisher, EventSubscriber};
    pub use crate::job::{JobEnvelope, JobPayload, QueueKind};
    pub use crate::memory::MemoryJobQueue;
    pub use crate::producer::JobProducer;
    pub use crate::queue::JobQueue;
    pub use crate::queues::{AnalysisRequest, AnalysisScheduler};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{AnalysisStore, TrajectoryStore};
    pub use crate::worker::{JobHandler, WorkerPool};
    pub use crate::{JobContext, JobError, JobId, JobResult};
}
