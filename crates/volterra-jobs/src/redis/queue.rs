//! Redis-backed job queue.
//!
//! Per queue kind the layout is three sorted sets: `pqueue` (ready, scored by
//! priority then age), `delayed` (scored by ready time) and `active` (scored
//! by claim deadline). Envelopes live under `job:{id}` and completion markers
//! under `done:{id}` with a TTL.

use super::RedisKeys;
use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::job::{JobEnvelope, JobId, QueueKind};
use crate::metrics::JobMetrics;
use crate::queue::{fail_decision, priority_score, FailOutcome, JobQueue, QueueStats};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Promotes due delayed jobs, then moves the best ready job into `active`.
///
/// KEYS: delayed, pqueue, active, priorities. ARGV: now_ms, deadline_ms.
const CLAIM_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  local ready = redis.call('ZSCORE', KEYS[1], id)
  local prio = tonumber(redis.call('HGET', KEYS[4], id) or '0')
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], -prio * 1000000000000 + tonumber(ready), id)
end
local popped = redis.call('ZPOPMIN', KEYS[2])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[2], popped[1])
return popped[1]
";

/// Returns claims whose deadline has passed to the ready set.
///
/// KEYS: active, pqueue, priorities. ARGV: now_ms.
const RECOVER_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  local prio = tonumber(redis.call('HGET', KEYS[3], id) or '0')
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], -prio * 1000000000000 + tonumber(ARGV[1]), id)
end
return #expired
";

/// Redis-backed [`JobQueue`].
pub struct RedisJobQueue {
    pool: Pool,
    keys: RedisKeys,
    completion_ttl_secs: u64,
    claim_script: Script,
    recover_script: Script,
}

impl RedisJobQueue {
    /// Create a new Redis job queue.
    pub fn new(pool: Pool, config: &JobsConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(config.redis.key_prefix.clone()),
            completion_ttl_secs: config.queue.completion_ttl_secs.max(1),
            claim_script: Script::new(CLAIM_SCRIPT),
            recover_script: Script::new(RECOVER_SCRIPT),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn load(&self, conn: &mut Connection, job_id: &str) -> JobResult<Option<JobEnvelope>> {
        let data: Option<String> = conn.get(self.keys.job(job_id)).await?;
        data.map(|json| JobEnvelope::from_json(&json)).transpose()
    }

    /// Envelopes in the dead letter queue of `kind`, oldest first.
    pub async fn dead_letters(&self, kind: QueueKind, limit: isize) -> JobResult<Vec<JobEnvelope>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(self.keys.dlq(kind), 0, limit - 1).await?;

        let mut envelopes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(envelope) = self.load(&mut conn, &id).await? {
                envelopes.push(envelope);
            }
        }
        Ok(envelopes)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> JobResult<JobId> {
        let mut conn = self.conn().await?;
        let job_id = envelope.job_id.clone();
        let kind = envelope.kind();
        let json = envelope.to_json()?;
        let now_ms = Utc::now().timestamp_millis();
        let ready_at = envelope.scheduled_at.timestamp_millis();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.job(job_id.as_str()), json)
            .ignore()
            .zrem(self.keys.dlq(kind), job_id.as_str())
            .ignore();
        if envelope.priority != 0 {
            pipe.hset(self.keys.priorities(kind), job_id.as_str(), envelope.priority)
                .ignore();
        }
        if ready_at > now_ms {
            pipe.zadd(self.keys.delayed(kind), job_id.as_str(), ready_at)
                .ignore();
        } else {
            pipe.zadd(
                self.keys.priority_queue(kind),
                job_id.as_str(),
                priority_score(envelope.priority, now_ms),
            )
            .ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;

        JobMetrics::job_enqueued(kind.as_str());
        debug!(job_id = %job_id, queue = %kind, "Enqueued job");

        Ok(job_id)
    }

    async fn dequeue(
        &self,
        kind: QueueKind,
        worker_id: &str,
        visibility: Duration,
    ) -> JobResult<Option<JobEnvelope>> {
        let mut conn = self.conn().await?;

        loop {
            let now_ms = Utc::now().timestamp_millis();
            let deadline = now_ms + i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX / 2);

            let claimed: Option<String> = self
                .claim_script
                .key(self.keys.delayed(kind))
                .key(self.keys.priority_queue(kind))
                .key(self.keys.active(kind))
                .key(self.keys.priorities(kind))
                .arg(now_ms)
                .arg(deadline)
                .invoke_async(&mut *conn)
                .await?;

            let Some(job_id) = claimed else {
                return Ok(None);
            };

            let Some(mut envelope) = self.load(&mut conn, &job_id).await? else {
                warn!(job_id = %job_id, "Dropping queued id without job data");
                let _: () = conn.zrem(self.keys.active(kind), &job_id).await?;
                continue;
            };

            envelope.attempt += 1;
            let _: () = conn
                .set(self.keys.job(&job_id), envelope.to_json()?)
                .await?;

            JobMetrics::job_dequeued(kind.as_str());
            debug!(
                job_id = %job_id,
                queue = %kind,
                attempt = envelope.attempt,
                worker_id = %worker_id,
                "Dequeued job"
            );
            return Ok(Some(envelope));
        }
    }

    async fn complete(&self, job_id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let done_key = self.keys.done(job_id.as_str());

        let Some(envelope) = self.load(&mut conn, job_id.as_str()).await? else {
            // Redelivered copy of a job that already finished.
            let _: () = conn.set_ex(done_key, 1, self.completion_ttl_secs).await?;
            return Ok(());
        };
        let kind = envelope.kind();

        let removed: Vec<i64> = redis::pipe()
            .atomic()
            .zrem(self.keys.active(kind), job_id.as_str())
            .set_ex(&done_key, 1, self.completion_ttl_secs)
            .ignore()
            .del(self.keys.job(job_id.as_str()))
            .ignore()
            .hdel(self.keys.priorities(kind), job_id.as_str())
            .ignore()
            .query_async(&mut *conn)
            .await?;

        if removed.first().copied().unwrap_or(0) > 0 {
            let _: () = conn.hincr(self.keys.stats(kind), "completed", 1).await?;
        }

        debug!(job_id = %job_id, "Completed job");
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, error: &JobError) -> JobResult<FailOutcome> {
        let mut conn = self.conn().await?;

        let Some(mut envelope) = self.load(&mut conn, job_id.as_str()).await? else {
            return Err(JobError::NotFound(job_id.to_string()));
        };
        envelope.last_error = Some(error.to_string());
        let outcome = fail_decision(&envelope, error);
        let kind = envelope.kind();

        if let FailOutcome::Retried { retry_at } = outcome {
            envelope.scheduled_at = retry_at;
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.job(job_id.as_str()), envelope.to_json()?)
            .ignore()
            .zrem(self.keys.active(kind), job_id.as_str())
            .ignore();

        match outcome {
            FailOutcome::Retried { retry_at } => {
                pipe.zadd(self.keys.delayed(kind), job_id.as_str(), retry_at.timestamp_millis())
                    .ignore()
                    .hincr(self.keys.stats(kind), "retried", 1)
                    .ignore();
                let _: () = pipe.query_async(&mut *conn).await?;

                JobMetrics::job_retried(kind.as_str());
                debug!(job_id = %job_id, retry_at = %retry_at, "Scheduled job retry");
            }
            FailOutcome::DeadLettered => {
                pipe.zadd(self.keys.dlq(kind), job_id.as_str(), Utc::now().timestamp_millis())
                    .ignore()
                    .hincr(self.keys.stats(kind), "dead_letter", 1)
                    .ignore();
                let _: () = pipe.query_async(&mut *conn).await?;

                JobMetrics::job_dead_lettered(kind.as_str());
                warn!(job_id = %job_id, error = %error, "Job moved to dead letter queue");
            }
        }

        Ok(outcome)
    }

    async fn is_completed(&self, job_id: &JobId) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(self.keys.done(job_id.as_str())).await?;
        Ok(exists)
    }

    async fn recover_expired(&self, kind: QueueKind) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();

        let count: u64 = self
            .recover_script
            .key(self.keys.active(kind))
            .key(self.keys.priority_queue(kind))
            .key(self.keys.priorities(kind))
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await?;

        if count > 0 {
            JobMetrics::jobs_recovered(kind.as_str(), count);
            warn!(queue = %kind, count, "Recovered expired claims");
        }
        Ok(count)
    }

    async fn queue_length(&self, kind: QueueKind) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.zcard(self.keys.priority_queue(kind)).await?;
        Ok(len)
    }

    async fn stats(&self, kind: QueueKind) -> JobResult<QueueStats> {
        let mut conn = self.conn().await?;

        let (pending, active, delayed, counters): (u64, u64, u64, HashMap<String, u64>) = redis::pipe()
            .zcard(self.keys.priority_queue(kind))
            .zcard(self.keys.active(kind))
            .zcard(self.keys.delayed(kind))
            .hgetall(self.keys.stats(kind))
            .query_async(&mut *conn)
            .await?;

        let counter = |name: &str| counters.get(name).copied().unwrap_or(0);
        let stats = QueueStats {
            queue: kind.as_str().to_string(),
            pending,
            active,
            delayed,
            completed: counter("completed"),
            retried: counter("retried"),
            dead_letter: counter("dead_letter"),
        };

        JobMetrics::update_queue_sizes(kind.as_str(), stats.pending, stats.active);
        Ok(stats)
    }

    async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }
}
