//! Cross-process event bus over Redis pub/sub.

use crate::error::{JobError, JobResult};
use crate::events::{EventPublisher, EventSubscriber, JobUpdate, JobUpdateEnvelope};
use async_trait::async_trait;
use deadpool_redis::Pool;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Publishes `{teamId, payload}` JSON on one channel shared by every process.
#[derive(Clone)]
pub struct RedisEventBus {
    pool: Pool,
    client: redis::Client,
    channel: String,
}

impl RedisEventBus {
    /// Subscriptions open their own connection from `url`; publishing uses the pool.
    pub fn new(pool: Pool, url: &str, channel: impl Into<String>) -> JobResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| JobError::Configuration(format!("Invalid Redis URL: {e}")))?;
        Ok(Self {
            pool,
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl EventPublisher for RedisEventBus {
    async fn publish(&self, team_id: &str, update: JobUpdate) -> JobResult<()> {
        let envelope = JobUpdateEnvelope {
            team_id: team_id.to_string(),
            payload: update,
        };
        let json = serde_json::to_string(&envelope)?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| JobError::Broadcast(e.to_string()))?;
        let receivers: i64 = conn
            .publish(&self.channel, json)
            .await
            .map_err(|e| JobError::Broadcast(e.to_string()))?;

        debug!(team_id = %team_id, receivers, "Published job update");
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for RedisEventBus {
    async fn subscribe(&self) -> JobResult<BoxStream<'static, JobUpdateEnvelope>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        info!(channel = %self.channel, "Subscribed to job update channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Unreadable job update payload");
                    return None;
                }
            };
            match serde_json::from_str::<JobUpdateEnvelope>(&payload) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(error = %e, "Discarding malformed job update");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
