//! Job update event bus.
//!
//! Workers publish a [`JobUpdate`] scoped to a team. Every server process
//! subscribes to the shared channel and re-emits the updates to its own
//! locally connected clients through a [`TeamBroadcaster`]. Delivery over the
//! channel is fire-and-forget; consumers reconcile through the stores when
//! they miss an update.

mod broadcaster;

pub use broadcaster::{ClientEvent, TeamBroadcaster};

use crate::error::{JobError, JobResult};
use crate::job::JobEnvelope;
use crate::metrics::EventMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Lifecycle status carried by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Retrying,
}

/// Normalised job update payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UpdateStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestep: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_type: Option<String>,
    /// Domain event name, e.g. `trajectory_processed`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl JobUpdate {
    /// Update for `envelope` with identity fields filled from its payload.
    pub fn for_job(envelope: &JobEnvelope, status: UpdateStatus) -> Self {
        use crate::job::JobPayload;

        let mut update = Self {
            job_id: Some(envelope.job_id.to_string()),
            status: Some(status),
            session_id: envelope.session_id.clone(),
            trajectory_id: envelope.payload.trajectory_id().map(str::to_string),
            timestep: envelope.payload.timestep(),
            timestamp: Some(Utc::now()),
            queue_type: Some(envelope.kind().as_str().to_string()),
            ..Self::default()
        };

        match &envelope.payload {
            JobPayload::TrajectoryProcessing(job) => {
                update.chunk_index = Some(job.chunk_index);
                update.total_chunks = Some(job.total_chunks);
                update.name = Some(job.name.clone());
                update.message = Some(job.message.clone());
            }
            JobPayload::AnalysisProcessing(job) => {
                update.analysis_id = Some(job.analysis_id.clone());
                update.session_start_time = job.session_start_time;
                update.name = Some(job.plugin.clone());
            }
            JobPayload::Rasterizer(job) => {
                update.session_start_time = job.session_start_time;
            }
            JobPayload::SshImport(job) => {
                update.name = job.name.clone();
            }
        }
        update
    }

    /// Team-level domain event not tied to a single job.
    pub fn event(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Sets the domain event name.
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the result body.
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Message on the shared channel: `{teamId, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateEnvelope {
    pub team_id: String,
    pub payload: JobUpdate,
}

/// Publishing side of the event bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Broadcast `update` to every process holding clients of `team_id`.
    async fn publish(&self, team_id: &str, update: JobUpdate) -> JobResult<()>;
}

/// Subscribing side of the event bus.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Stream of every update published on the channel.
    async fn subscribe(&self) -> JobResult<BoxStream<'static, JobUpdateEnvelope>>;
}

/// Publish and log failures instead of returning them.
///
/// A job's own outcome never depends on whether its update was delivered.
pub async fn publish_quietly(publisher: &dyn EventPublisher, team_id: &str, update: JobUpdate) {
    match publisher.publish(team_id, update).await {
        Ok(()) => EventMetrics::published(),
        Err(e) => {
            EventMetrics::publish_failed();
            warn!(team_id = %team_id, error = %e, "Failed to publish job update");
        }
    }
}

/// In-process bus over a tokio broadcast channel.
#[derive(Clone)]
pub struct LocalEventBus {
    tx: broadcast::Sender<JobUpdateEnvelope>,
}

impl LocalEventBus {
    /// Creates a bus buffering up to `capacity` updates per lagging receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Raw receiver, mostly for tests.
    pub fn receiver(&self) -> broadcast::Receiver<JobUpdateEnvelope> {
        self.tx.subscribe()
    }

    /// Live subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for LocalEventBus {
    async fn publish(&self, team_id: &str, update: JobUpdate) -> JobResult<()> {
        let envelope = JobUpdateEnvelope {
            team_id: team_id.to_string(),
            payload: update,
        };
        // No receivers is not an error; nobody is watching this team yet.
        if self.tx.send(envelope).is_err() {
            debug!(team_id = %team_id, "No local subscribers for job update");
        }
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for LocalEventBus {
    async fn subscribe(&self) -> JobResult<BoxStream<'static, JobUpdateEnvelope>> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(error = %e, "Local event subscriber lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Publisher that always fails; used to check that jobs ignore broadcast errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
    async fn publish(&self, _team_id: &str, _update: JobUpdate) -> JobResult<()> {
        Err(JobError::Broadcast("no event channel configured".into()))
    }
}
