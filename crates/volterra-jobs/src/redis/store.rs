//! Redis-backed analysis and trajectory stores.
//!
//! An analysis is a hash (`data` holds the creation-time JSON, the mutable
//! fields sit next to it) plus four timestep sets. Every mutation is one Lua
//! script. Trajectory stats are a versioned JSON document updated by a
//! compare-and-set script.

use super::RedisKeys;
use crate::error::{JobError, JobResult};
use crate::store::{
    Analysis, AnalysisStatus, AnalysisStore, ChunkOutcome, ChunkRecorded, CompletionOutcome,
    FailedFrame, FrameSets, TrajectoryStats, TrajectoryStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, Script};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

const EXPECTED: &str = "expected";
const COMPLETED: &str = "completed";
const FAILED: &str = "failed";
const PENDING: &str = "pending";

/// KEYS: analysis, expected, completed, failed, pending. ARGV: timestep, now.
///
/// Returns `{state, completed_frames, total_frames, finished}` where state is
/// -1 (ignored), 0 (already counted) or 1 (recorded).
const COMPLETE_FRAME_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return {-1, 0, 0, 0} end
if redis.call('HGET', KEYS[1], 'status') == 'cancelled' then return {-1, 0, 0, 0} end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 0 then return {-1, 0, 0, 0} end
redis.call('SREM', KEYS[4], ARGV[1])
redis.call('SREM', KEYS[5], ARGV[1])
if redis.call('SADD', KEYS[3], ARGV[1]) == 0 then return {0, 0, 0, 0} end
local total = tonumber(redis.call('HGET', KEYS[1], 'total_frames'))
local done = tonumber(redis.call('HGET', KEYS[1], 'completed_frames'))
if done < total then
  done = redis.call('HINCRBY', KEYS[1], 'completed_frames', 1)
end
local finished = 0
if done >= total and redis.call('HSETNX', KEYS[1], 'finished_at', ARGV[2]) == 1 then
  redis.call('HSET', KEYS[1], 'status', 'completed')
  finished = 1
end
return {1, done, total, finished}
";

/// KEYS: analysis, expected, completed, failed, pending. ARGV: timestep.
const FAIL_FRAME_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if redis.call('HGET', KEYS[1], 'status') == 'cancelled' then return 0 end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 0 then return 0 end
if redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then return 0 end
redis.call('SREM', KEYS[5], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[1])
return 1
";

/// KEYS: analysis, expected, completed, pending.
///
/// Returns `{}` for an unknown analysis, otherwise `{'ok', ts...}`.
const TAKE_RETRYABLE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return {} end
local retry = redis.call('SDIFF', KEYS[2], KEYS[3], KEYS[4])
local out = {'ok'}
for _, ts in ipairs(retry) do
  redis.call('SADD', KEYS[4], ts)
  table.insert(out, ts)
end
return out
";

/// KEYS: analysis. ARGV: now.
const CANCEL_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
if redis.call('HGET', KEYS[1], 'status') ~= 'running' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'cancelled')
redis.call('HSETNX', KEYS[1], 'finished_at', ARGV[1])
return 1
";

/// KEYS: guard. ARGV: holder, ttl_ms.
const CLAIM_GUARD_SCRIPT: &str = r"
local owner = redis.call('GET', KEYS[1])
if owner and owner ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
";

/// KEYS: guard. ARGV: holder.
const RELEASE_GUARD_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
end
return 1
";

/// KEYS: trajectory. ARGV: expected version, data.
const TRAJECTORY_CAS_SCRIPT: &str = r"
local version = redis.call('HGET', KEYS[1], 'version')
if version ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'version', tostring(tonumber(version) + 1), 'data', ARGV[2])
return 1
";

/// Compare-and-set attempts before `record_chunk` reports contention.
const MAX_CAS_ATTEMPTS: usize = 32;

/// Rebuilds an analysis from its hash fields.
fn analysis_from_hash(fields: &HashMap<String, String>) -> JobResult<Option<Analysis>> {
    let Some(data) = fields.get("data") else {
        return Ok(None);
    };
    let mut analysis: Analysis = serde_json::from_str(data)?;

    if let Some(done) = fields.get("completed_frames") {
        analysis.completed_frames = done
            .parse()
            .map_err(|_| JobError::Internal(format!("bad completed_frames '{done}'")))?;
    }
    if let Some(status) = fields.get("status").and_then(|s| AnalysisStatus::parse(s)) {
        analysis.status = status;
    }
    analysis.finished_at = fields
        .get("finished_at")
        .map(|ts| {
            DateTime::parse_from_rfc3339(ts)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| JobError::Internal(format!("bad finished_at '{ts}': {e}")))
        })
        .transpose()?;

    Ok(Some(analysis))
}

fn completion_from_reply(reply: &[i64]) -> CompletionOutcome {
    match reply {
        [1, done, total, finished, ..] => CompletionOutcome::Recorded {
            completed_frames: u64::try_from(*done).unwrap_or(0),
            total_frames: u64::try_from(*total).unwrap_or(0),
            finished: *finished == 1,
        },
        [0, ..] => CompletionOutcome::AlreadyCounted,
        _ => CompletionOutcome::Ignored,
    }
}

/// Redis-backed [`AnalysisStore`].
pub struct RedisAnalysisStore {
    pool: Pool,
    keys: RedisKeys,
    complete_script: Script,
    fail_script: Script,
    retry_script: Script,
    cancel_script: Script,
    claim_script: Script,
    release_script: Script,
}

impl RedisAnalysisStore {
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            complete_script: Script::new(COMPLETE_FRAME_SCRIPT),
            fail_script: Script::new(FAIL_FRAME_SCRIPT),
            retry_script: Script::new(TAKE_RETRYABLE_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
            claim_script: Script::new(CLAIM_GUARD_SCRIPT),
            release_script: Script::new(RELEASE_GUARD_SCRIPT),
        }
    }

    async fn conn(&self) -> JobResult<Connection> {
        Ok(self.pool.get().await?)
    }

    fn set_key(&self, analysis_id: &str, set: &str) -> String {
        self.keys.analysis_frames(analysis_id, set)
    }
}

#[async_trait]
impl AnalysisStore for RedisAnalysisStore {
    async fn create(&self, analysis: &Analysis, timesteps: &[u64]) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let id = analysis.id.as_str();
        let expected: BTreeSet<u64> = timesteps.iter().copied().collect();

        let mut analysis = analysis.clone();
        analysis.total_frames = expected.len() as u64;
        let data = serde_json::to_string(&analysis)?;
        let expected: Vec<u64> = expected.into_iter().collect();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(vec![
                self.keys.analysis(id),
                self.set_key(id, EXPECTED),
                self.set_key(id, COMPLETED),
                self.set_key(id, FAILED),
                self.set_key(id, PENDING),
            ])
            .ignore()
            .hset_multiple(
                self.keys.analysis(id),
                &[
                    ("data", data),
                    ("total_frames", analysis.total_frames.to_string()),
                    ("completed_frames", analysis.completed_frames.to_string()),
                    ("status", analysis.status.as_str().to_string()),
                ],
            )
            .ignore();
        if !expected.is_empty() {
            pipe.sadd(self.set_key(id, EXPECTED), &expected)
                .ignore()
                .sadd(self.set_key(id, PENDING), &expected)
                .ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;

        debug!(analysis_id = %id, frames = analysis.total_frames, "Created analysis");
        Ok(())
    }

    async fn get(&self, analysis_id: &str) -> JobResult<Option<Analysis>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.keys.analysis(analysis_id)).await?;
        analysis_from_hash(&fields)
    }

    async fn frame_sets(&self, analysis_id: &str) -> JobResult<Option<FrameSets>> {
        let mut conn = self.conn().await?;

        let (exists, expected, completed, failed, pending): (
            bool,
            BTreeSet<u64>,
            BTreeSet<u64>,
            BTreeSet<u64>,
            BTreeSet<u64>,
        ) = redis::pipe()
            .exists(self.keys.analysis(analysis_id))
            .smembers(self.set_key(analysis_id, EXPECTED))
            .smembers(self.set_key(analysis_id, COMPLETED))
            .smembers(self.set_key(analysis_id, FAILED))
            .smembers(self.set_key(analysis_id, PENDING))
            .query_async(&mut *conn)
            .await?;

        Ok(exists.then_some(FrameSets {
            expected,
            completed,
            failed,
            pending,
        }))
    }

    async fn claim_frame(
        &self,
        analysis_id: &str,
        timestep: u64,
        holder: &str,
        ttl: Duration,
    ) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let claimed: i64 = self
            .claim_script
            .key(self.keys.frame_guard(analysis_id, timestep))
            .arg(holder)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(claimed == 1)
    }

    async fn release_frame(&self, analysis_id: &str, timestep: u64, holder: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .release_script
            .key(self.keys.frame_guard(analysis_id, timestep))
            .arg(holder)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn record_completion(&self, analysis_id: &str, timestep: u64) -> JobResult<CompletionOutcome> {
        let mut conn = self.conn().await?;

        let reply: Vec<i64> = self
            .complete_script
            .key(self.keys.analysis(analysis_id))
            .key(self.set_key(analysis_id, EXPECTED))
            .key(self.set_key(analysis_id, COMPLETED))
            .key(self.set_key(analysis_id, FAILED))
            .key(self.set_key(analysis_id, PENDING))
            .arg(timestep)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut *conn)
            .await?;

        let outcome = completion_from_reply(&reply);
        if let CompletionOutcome::Recorded { finished: true, .. } = outcome {
            debug!(analysis_id = %analysis_id, "Analysis finished");
        }
        Ok(outcome)
    }

    async fn record_failure(&self, analysis_id: &str, timestep: u64, error: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;

        let recorded: i64 = self
            .fail_script
            .key(self.keys.analysis(analysis_id))
            .key(self.set_key(analysis_id, EXPECTED))
            .key(self.set_key(analysis_id, COMPLETED))
            .key(self.set_key(analysis_id, FAILED))
            .key(self.set_key(analysis_id, PENDING))
            .arg(timestep)
            .invoke_async(&mut *conn)
            .await?;

        if recorded == 1 {
            debug!(analysis_id = %analysis_id, timestep, error = %error, "Recorded frame failure");
        }
        Ok(recorded == 1)
    }

    async fn take_retryable(&self, analysis_id: &str) -> JobResult<Vec<u64>> {
        let mut conn = self.conn().await?;

        let reply: Vec<String> = self
            .retry_script
            .key(self.keys.analysis(analysis_id))
            .key(self.set_key(analysis_id, EXPECTED))
            .key(self.set_key(analysis_id, COMPLETED))
            .key(self.set_key(analysis_id, PENDING))
            .invoke_async(&mut *conn)
            .await?;

        let Some((marker, rest)) = reply.split_first() else {
            return Err(JobError::NotFound(format!("analysis {analysis_id}")));
        };
        if marker != "ok" {
            return Err(JobError::Internal(format!("unexpected retry reply '{marker}'")));
        }

        let mut timesteps = rest
            .iter()
            .map(|ts| {
                ts.parse::<u64>()
                    .map_err(|_| JobError::Internal(format!("bad timestep '{ts}'")))
            })
            .collect::<JobResult<Vec<u64>>>()?;
        timesteps.sort_unstable();
        Ok(timesteps)
    }

    async fn unmark_pending(&self, analysis_id: &str, timesteps: &[u64]) -> JobResult<()> {
        if timesteps.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn.srem(self.set_key(analysis_id, PENDING), timesteps).await?;
        Ok(())
    }

    async fn cancel(&self, analysis_id: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;

        let result: i64 = self
            .cancel_script
            .key(self.keys.analysis(analysis_id))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut *conn)
            .await?;

        match result {
            -1 => Err(JobError::NotFound(format!("analysis {analysis_id}"))),
            1 => Ok(true),
            _ => Ok(false),
        }
    }
}

/// Redis-backed [`TrajectoryStore`].
pub struct RedisTrajectoryStore {
    pool: Pool,
    keys: RedisKeys,
    cas_script: Script,
}

impl RedisTrajectoryStore {
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            cas_script: Script::new(TRAJECTORY_CAS_SCRIPT),
        }
    }

    async fn conn(&self) -> JobResult<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn load(&self, conn: &mut Connection, trajectory_id: &str) -> JobResult<Option<(String, TrajectoryStats)>> {
        let (version, data): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.keys.trajectory(trajectory_id))
            .arg("version")
            .arg("data")
            .query_async(&mut **conn)
            .await?;

        match (version, data) {
            (Some(version), Some(data)) => Ok(Some((version, serde_json::from_str(&data)?))),
            _ => Ok(None),
        }
    }

    /// Read-modify-write of the stats under the version check.
    ///
    /// `f` returns its result and whether the stats changed; unchanged stats
    /// are not written back. `None` for an unknown trajectory.
    async fn update<T>(
        &self,
        trajectory_id: &str,
        f: impl Fn(&mut TrajectoryStats) -> (T, bool) + Send,
    ) -> JobResult<Option<T>> {
        let mut conn = self.conn().await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((version, mut stats)) = self.load(&mut conn, trajectory_id).await? else {
                return Ok(None);
            };

            let (result, changed) = f(&mut stats);
            if !changed {
                return Ok(Some(result));
            }

            let swapped: i64 = self
                .cas_script
                .key(self.keys.trajectory(trajectory_id))
                .arg(&version)
                .arg(serde_json::to_string(&stats)?)
                .invoke_async(&mut *conn)
                .await?;
            if swapped == 1 {
                return Ok(Some(result));
            }
            debug!(trajectory_id = %trajectory_id, "Trajectory stats changed concurrently, retrying");
        }

        Err(JobError::Unavailable(format!(
            "trajectory {trajectory_id} stats under contention"
        )))
    }
}

#[async_trait]
impl TrajectoryStore for RedisTrajectoryStore {
    async fn register(&self, stats: &TrajectoryStats) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let data = serde_json::to_string(stats)?;
        let _: () = conn
            .hset_multiple(
                self.keys.trajectory(&stats.trajectory_id),
                &[("version", "0".to_string()), ("data", data)],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, trajectory_id: &str) -> JobResult<Option<TrajectoryStats>> {
        let mut conn = self.conn().await?;
        Ok(self.load(&mut conn, trajectory_id).await?.map(|(_, stats)| stats))
    }

    async fn record_chunk(&self, trajectory_id: &str, outcome: &ChunkOutcome) -> JobResult<ChunkRecorded> {
        self.update(trajectory_id, |stats| {
            let recorded = stats.apply(outcome);
            (recorded, recorded.newly_recorded)
        })
        .await?
        .ok_or_else(|| JobError::NotFound(format!("trajectory {trajectory_id}")))
    }

    async fn failed_frames(&self, trajectory_id: &str) -> JobResult<BTreeMap<u64, FailedFrame>> {
        Ok(self
            .get(trajectory_id)
            .await?
            .map(|stats| stats.failed_frames)
            .unwrap_or_default())
    }

    async fn take_retryable_frames(
        &self,
        trajectory_id: &str,
    ) -> JobResult<Option<(TrajectoryStats, BTreeMap<u64, FailedFrame>)>> {
        self.update(trajectory_id, |stats| {
            let taken = stats.take_retryable();
            let changed = !taken.is_empty();
            ((stats.clone(), taken), changed)
        })
        .await
    }

    async fn release_retry(&self, trajectory_id: &str, timesteps: &[u64]) -> JobResult<()> {
        self.update(trajectory_id, |stats| ((), stats.release_retry(timesteps)))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_from_hash_overrides_mutable_fields() {
        let analysis = Analysis::new("team", "t1", "cna", serde_json::json!({"cutoff": 3.5}), 4);
        let finished = Utc::now();
        let fields: HashMap<String, String> = [
            ("data", serde_json::to_string(&analysis).unwrap()),
            ("completed_frames", "4".to_string()),
            ("status", "completed".to_string()),
            ("finished_at", finished.to_rfc3339()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let restored = analysis_from_hash(&fields).unwrap().unwrap();
        assert_eq!(restored.id, analysis.id);
        assert_eq!(restored.completed_frames, 4);
        assert_eq!(restored.status, AnalysisStatus::Completed);
        assert_eq!(restored.finished_at.map(|t| t.timestamp()), Some(finished.timestamp()));
    }

    #[test]
    fn test_missing_analysis_hash() {
        assert!(analysis_from_hash(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_completion_reply() {
        assert_eq!(
            completion_from_reply(&[1, 3, 4, 0]),
            CompletionOutcome::Recorded {
                completed_frames: 3,
                total_frames: 4,
                finished: false
            }
        );
        assert_eq!(completion_from_reply(&[0, 0, 0, 0]), CompletionOutcome::AlreadyCounted);
        assert_eq!(completion_from_reply(&[-1, 0, 0, 0]), CompletionOutcome::Ignored);
        assert_eq!(completion_from_reply(&[]), CompletionOutcome::Ignored);
    }
}
