use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::{
    backend::{BoxStream, QueueBackend},
    BackoffPolicy, ClaimToken, ClaimedJob, EnqueueOptions, FailOutcome, JobEvent, JobId,
    JobRecord, JobStatus, RelayError, RelayResult, RetentionPolicy, TaskEnvelope,
};

/// Default key prefix for all queue data
const DEFAULT_PREFIX: &str = "relay";

/// Atomically promote due retries, pop the next waiting job, and claim it:
/// charge an attempt, stamp the claim token/deadline, and index the claim
/// deadline in the active set for the reaper.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
if #due > 0 then
  for _, id in ipairs(due) do
    redis.call('RPUSH', KEYS[1], id)
  end
  redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
end
local id = redis.call('LPOP', KEYS[1])
if not id then
  return false
end
local jk = ARGV[4] .. id
if redis.call('EXISTS', jk) == 0 then
  return false
end
local attempts = redis.call('HINCRBY', jk, 'attempts', 1)
redis.call('HSET', jk, 'status', 'claimed', 'claim_token', ARGV[3], 'claim_until', ARGV[2], 'updated_at', ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[2], id)
return {id, attempts, redis.call('HGETALL', jk)}
"#;

/// Token-guarded completion: mark completed, move to the completed index,
/// and trim that index by the job's retention policy (age, then count),
/// deleting trimmed job hashes.
const COMPLETE_SCRIPT: &str = r#"
local jk = ARGV[4] .. ARGV[1]
if redis.call('EXISTS', jk) == 0 then return 'not_found' end
local status = redis.call('HGET', jk, 'status')
if status == 'completed' or status == 'failed' then return 'terminal' end
if redis.call('HGET', jk, 'claim_token') ~= ARGV[2] then return 'bad_token' end
local claim_until = tonumber(redis.call('HGET', jk, 'claim_until'))
if claim_until and claim_until < tonumber(ARGV[3]) then return 'expired' end
redis.call('HSET', jk, 'status', 'completed', 'finished_at', ARGV[3], 'updated_at', ARGV[3])
redis.call('HDEL', jk, 'claim_token', 'claim_until', 'retry_at')
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
local cutoff = tonumber(ARGV[3]) - tonumber(redis.call('HGET', jk, 'retain_completed_age_ms'))
local keep = tonumber(redis.call('HGET', jk, 'retain_completed_count'))
local dropped = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', cutoff)
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', cutoff)
local n = redis.call('ZCARD', KEYS[2])
if n > keep then
  local extra = redis.call('ZRANGE', KEYS[2], 0, n - keep - 1)
  for _, oid in ipairs(extra) do table.insert(dropped, oid) end
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, n - keep - 1)
end
for _, oid in ipairs(dropped) do redis.call('DEL', ARGV[4] .. oid) end
return 'ok'
"#;

/// Token-guarded failure: the retry decision is made here, inside the queue.
/// If attempt budget remains the next retry time is computed from the stored
/// backoff fields and the job parks in the delayed set; otherwise it is
/// terminal and the failed index is trimmed by retention.
const FAIL_SCRIPT: &str = r#"
local jk = ARGV[4] .. ARGV[1]
if redis.call('EXISTS', jk) == 0 then return {'not_found'} end
local status = redis.call('HGET', jk, 'status')
if status == 'completed' or status == 'failed' then return {'terminal'} end
if redis.call('HGET', jk, 'claim_token') ~= ARGV[2] then return {'bad_token'} end
local now = tonumber(ARGV[3])
local claim_until = tonumber(redis.call('HGET', jk, 'claim_until'))
if claim_until and claim_until < now then return {'expired'} end
redis.call('HSET', jk, 'last_error', ARGV[5], 'updated_at', ARGV[3])
redis.call('HDEL', jk, 'claim_token', 'claim_until')
redis.call('ZREM', KEYS[1], ARGV[1])
local attempts = tonumber(redis.call('HGET', jk, 'attempts'))
local max_attempts = tonumber(redis.call('HGET', jk, 'max_attempts'))
if attempts < max_attempts then
  local delay = tonumber(redis.call('HGET', jk, 'backoff_delay_ms'))
  if redis.call('HGET', jk, 'backoff_kind') == 'exponential' then
    delay = delay * 2 ^ (attempts - 1)
  end
  local retry_at = now + math.floor(delay)
  redis.call('HSET', jk, 'status', 'retrying', 'retry_at', retry_at)
  redis.call('ZADD', KEYS[2], retry_at, ARGV[1])
  return {'retry', tostring(retry_at)}
end
redis.call('HSET', jk, 'status', 'failed', 'finished_at', ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
local cutoff = now - tonumber(redis.call('HGET', jk, 'retain_failed_age_ms'))
local keep = tonumber(redis.call('HGET', jk, 'retain_failed_count'))
local dropped = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', cutoff)
redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', cutoff)
local n = redis.call('ZCARD', KEYS[3])
if n > keep then
  local extra = redis.call('ZRANGE', KEYS[3], 0, n - keep - 1)
  for _, oid in ipairs(extra) do table.insert(dropped, oid) end
  redis.call('ZREMRANGEBYRANK', KEYS[3], 0, n - keep - 1)
end
for _, oid in ipairs(dropped) do redis.call('DEL', ARGV[4] .. oid) end
return {'failed'}
"#;

/// Return expired claims to the queue. Attempts were charged at claim time,
/// so a job abandoned on its final attempt goes terminal here.
const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local reclaimed = 0
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  local jk = ARGV[2] .. id
  if redis.call('EXISTS', jk) == 1 then
    local attempts = tonumber(redis.call('HGET', jk, 'attempts'))
    local max_attempts = tonumber(redis.call('HGET', jk, 'max_attempts'))
    redis.call('HDEL', jk, 'claim_token', 'claim_until')
    if attempts >= max_attempts then
      redis.call('HSET', jk, 'status', 'failed', 'last_error', 'Claim expired after final attempt', 'finished_at', ARGV[1], 'updated_at', ARGV[1])
      redis.call('ZADD', KEYS[3], ARGV[1], id)
    else
      redis.call('HSET', jk, 'status', 'retrying', 'retry_at', ARGV[1], 'last_error', 'Claim expired', 'updated_at', ARGV[1])
      redis.call('RPUSH', KEYS[2], id)
    end
    reclaimed = reclaimed + 1
  end
end
return reclaimed
"#;

/// Redis-backed durable queue binding.
///
/// Key layout (per queue `q` under prefix `p`):
/// - `p:q:wait` - LIST of job ids, FIFO
/// - `p:q:delayed` - ZSET of retrying jobs, scored by retry time (ms)
/// - `p:q:active` - ZSET of claimed jobs, scored by claim deadline (ms)
/// - `p:q:completed` / `p:q:failed` - ZSETs of finished jobs for retention
/// - `p:q:job:<id>` - HASH with the envelope, options, and runtime state
///
/// Every state transition runs as a Lua script, so claims are exclusive and
/// acks are token-guarded without client-side locking. The connection is a
/// multiplexed [`ConnectionManager`]: safe to share across all in-flight
/// handlers, with no implicit cap on outstanding commands.
pub struct RedisBackend {
    manager: ConnectionManager,
    prefix: String,
    claim_timeout: Duration,
    event_broadcaster: broadcast::Sender<JobEvent>,
    claim_script: Script,
    complete_script: Script,
    fail_script: Script,
    reclaim_script: Script,
}

impl RedisBackend {
    /// Connect to the store behind `url` (e.g. `redis://localhost:6379`).
    ///
    /// The URL is resolved for both IPv4 and IPv6. Fails fast if the store
    /// is unreachable rather than queueing commands against a dead
    /// connection.
    pub async fn connect(url: &str) -> RelayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self::with_manager(manager))
    }

    /// Build a backend over an existing connection manager
    pub fn with_manager(manager: ConnectionManager) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1024);

        Self {
            manager,
            prefix: DEFAULT_PREFIX.to_string(),
            claim_timeout: Duration::from_secs(300),
            event_broadcaster,
            claim_script: Script::new(CLAIM_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
        }
    }

    /// Override the key prefix (default `relay`)
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Override the claim deadline (default 5 minutes)
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    fn wait_key(&self, queue: &str) -> String {
        format!("{}:{}:wait", self.prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.prefix, queue)
    }

    fn active_key(&self, queue: &str) -> String {
        format!("{}:{}:active", self.prefix, queue)
    }

    fn completed_key(&self, queue: &str) -> String {
        format!("{}:{}:completed", self.prefix, queue)
    }

    fn failed_key(&self, queue: &str) -> String {
        format!("{}:{}:failed", self.prefix, queue)
    }

    fn job_prefix(&self, queue: &str) -> String {
        format!("{}:{}:job:", self.prefix, queue)
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    /// Reclaim expired claims on `queue`; returns how many were reclaimed.
    /// Run this periodically (the worker binary spawns a reaper loop).
    pub async fn reap_expired_claims(&self, queue: &str) -> RelayResult<usize> {
        let mut conn = self.manager.clone();
        let now_ms = Utc::now().timestamp_millis();

        let reclaimed: usize = self
            .reclaim_script
            .key(self.active_key(queue))
            .key(self.wait_key(queue))
            .key(self.failed_key(queue))
            .arg(now_ms)
            .arg(self.job_prefix(queue))
            .invoke_async(&mut conn)
            .await?;

        if reclaimed > 0 {
            debug!(queue, reclaimed, "reclaimed expired claims");
        }

        Ok(reclaimed)
    }

    async fn fetch_record(&self, queue: &str, job_id: &JobId) -> RelayResult<JobRecord> {
        let mut conn = self.manager.clone();
        let key = format!("{}{}", self.job_prefix(queue), job_id);

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Err(RelayError::JobNotFound(job_id.to_string()));
        }

        record_from_hash(job_id.clone(), queue, &fields)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    #[instrument(skip(self, envelope, options))]
    async fn enqueue(
        &self,
        queue: &str,
        envelope: TaskEnvelope,
        options: EnqueueOptions,
    ) -> RelayResult<JobId> {
        let job_id = JobId::new();
        let now = Utc::now();
        let key = format!("{}{}", self.job_prefix(queue), job_id);

        let (backoff_kind, backoff_delay) = backoff_fields(&options.backoff);
        let envelope_json = serde_json::to_string(&envelope)?;

        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &key,
                &[
                    ("envelope", envelope_json.as_str()),
                    ("queue", queue),
                    ("status", "enqueued"),
                    ("backoff_kind", backoff_kind),
                ],
            )
            .ignore()
            .hset(&key, "attempts", 0)
            .ignore()
            .hset(&key, "max_attempts", options.attempts)
            .ignore()
            .hset(&key, "backoff_delay_ms", backoff_delay)
            .ignore()
            .hset(
                &key,
                "retain_completed_age_ms",
                options.retain_completed.age.as_millis() as u64,
            )
            .ignore()
            .hset(&key, "retain_completed_count", options.retain_completed.count)
            .ignore()
            .hset(
                &key,
                "retain_failed_age_ms",
                options.retain_failed.age.as_millis() as u64,
            )
            .ignore()
            .hset(&key, "retain_failed_count", options.retain_failed.count)
            .ignore()
            .hset(&key, "created_at", now.timestamp_millis())
            .ignore()
            .hset(&key, "updated_at", now.timestamp_millis())
            .ignore()
            .rpush(self.wait_key(queue), job_id.as_str())
            .ignore();
        let () = pipe.query_async(&mut conn).await?;

        self.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            at: now,
        });

        Ok(job_id)
    }

    async fn claim(&self, queue: &str) -> RelayResult<Option<ClaimedJob>> {
        let mut conn = self.manager.clone();
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let claim_until_ms = now_ms + self.claim_timeout.as_millis() as i64;
        let token = ClaimToken::new();

        let result: Option<(String, u32, Vec<String>)> = self
            .claim_script
            .key(self.wait_key(queue))
            .key(self.delayed_key(queue))
            .key(self.active_key(queue))
            .arg(now_ms)
            .arg(claim_until_ms)
            .arg(token.as_str())
            .arg(self.job_prefix(queue))
            .invoke_async(&mut conn)
            .await?;

        let Some((id, attempts, raw_fields)) = result else {
            return Ok(None);
        };

        let fields: HashMap<String, String> = raw_fields
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        let job_id = JobId::from(id);
        let record = record_from_hash(job_id.clone(), queue, &fields)?;
        let claim_until = millis_to_datetime(claim_until_ms);

        self.emit(JobEvent::Claimed {
            job_id,
            attempt: attempts,
            claim_until,
            at: now,
        });

        Ok(Some(ClaimedJob {
            record,
            token,
            claim_until,
        }))
    }

    async fn ack_complete(
        &self,
        queue: &str,
        job_id: JobId,
        token: ClaimToken,
    ) -> RelayResult<()> {
        let mut conn = self.manager.clone();
        let now = Utc::now();

        let verdict: String = self
            .complete_script
            .key(self.active_key(queue))
            .key(self.completed_key(queue))
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now.timestamp_millis())
            .arg(self.job_prefix(queue))
            .invoke_async(&mut conn)
            .await?;

        match verdict.as_str() {
            "ok" => {
                self.emit(JobEvent::Completed {
                    job_id,
                    at: now,
                });
                Ok(())
            }
            other => Err(verdict_error(other, &job_id)),
        }
    }

    async fn ack_fail(
        &self,
        queue: &str,
        job_id: JobId,
        token: ClaimToken,
        error: String,
    ) -> RelayResult<FailOutcome> {
        let mut conn = self.manager.clone();
        let now = Utc::now();

        let verdict: Vec<String> = self
            .fail_script
            .key(self.active_key(queue))
            .key(self.delayed_key(queue))
            .key(self.failed_key(queue))
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now.timestamp_millis())
            .arg(self.job_prefix(queue))
            .arg(&error)
            .invoke_async(&mut conn)
            .await?;

        match verdict.first().map(String::as_str) {
            Some("retry") => {
                let retry_ms: i64 = verdict
                    .get(1)
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        RelayError::Storage("malformed retry verdict from queue".to_string())
                    })?;
                let retry_at = millis_to_datetime(retry_ms);

                self.emit(JobEvent::Retrying {
                    job_id,
                    retry_at,
                    error,
                    at: now,
                });

                Ok(FailOutcome::Retrying { retry_at })
            }
            Some("failed") => {
                self.emit(JobEvent::Failed {
                    job_id,
                    error,
                    at: now,
                });

                Ok(FailOutcome::Terminal)
            }
            Some(other) => Err(verdict_error(other, &job_id)),
            None => Err(RelayError::Storage(
                "empty verdict from queue".to_string(),
            )),
        }
    }

    async fn get_status(&self, queue: &str, job_id: JobId) -> RelayResult<JobStatus> {
        Ok(self.fetch_record(queue, &job_id).await?.status)
    }

    async fn get_record(&self, queue: &str, job_id: JobId) -> RelayResult<JobRecord> {
        self.fetch_record(queue, &job_id).await
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};

        let receiver = self.event_broadcaster.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }
}

fn backoff_fields(backoff: &BackoffPolicy) -> (&'static str, u64) {
    match backoff {
        BackoffPolicy::Exponential { delay } => ("exponential", delay.as_millis() as u64),
        BackoffPolicy::Fixed { delay } => ("fixed", delay.as_millis() as u64),
    }
}

fn verdict_error(verdict: &str, job_id: &JobId) -> RelayError {
    match verdict {
        "not_found" => RelayError::JobNotFound(job_id.to_string()),
        "terminal" => RelayError::JobAlreadyTerminal,
        "bad_token" => RelayError::InvalidClaimToken,
        "expired" => RelayError::ClaimExpired,
        other => RelayError::Storage(format!("unexpected queue verdict: {other}")),
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_millis_field(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.parse::<i64>().ok())
        .map(millis_to_datetime)
}

fn required_u64(fields: &HashMap<String, String>, name: &str) -> RelayResult<u64> {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| RelayError::Storage(format!("job hash missing field: {name}")))
}

/// Rebuild a [`JobRecord`] from the flat hash the queue stores
fn record_from_hash(
    job_id: JobId,
    queue: &str,
    fields: &HashMap<String, String>,
) -> RelayResult<JobRecord> {
    let envelope: TaskEnvelope = serde_json::from_str(
        fields
            .get("envelope")
            .ok_or_else(|| RelayError::Storage("job hash missing field: envelope".to_string()))?,
    )?;

    let delay = Duration::from_millis(required_u64(fields, "backoff_delay_ms")?);
    let backoff = match fields.get("backoff_kind").map(String::as_str) {
        Some("fixed") => BackoffPolicy::Fixed { delay },
        _ => BackoffPolicy::Exponential { delay },
    };

    let options = EnqueueOptions {
        attempts: required_u64(fields, "max_attempts")? as u32,
        backoff,
        retain_completed: RetentionPolicy {
            age: Duration::from_millis(required_u64(fields, "retain_completed_age_ms")?),
            count: required_u64(fields, "retain_completed_count")? as usize,
        },
        retain_failed: RetentionPolicy {
            age: Duration::from_millis(required_u64(fields, "retain_failed_age_ms")?),
            count: required_u64(fields, "retain_failed_count")? as usize,
        },
    };

    let last_error = fields.get("last_error").cloned();
    let status = match fields.get("status").map(String::as_str) {
        Some("claimed") => JobStatus::Claimed {
            claim_until: parse_millis_field(fields, "claim_until").unwrap_or_default(),
        },
        Some("retrying") => JobStatus::Retrying {
            retry_at: parse_millis_field(fields, "retry_at").unwrap_or_default(),
        },
        Some("completed") => JobStatus::Completed {
            completed_at: parse_millis_field(fields, "finished_at").unwrap_or_default(),
        },
        Some("failed") => JobStatus::Failed {
            failed_at: parse_millis_field(fields, "finished_at").unwrap_or_default(),
            error: last_error.clone().unwrap_or_default(),
        },
        _ => JobStatus::Enqueued,
    };

    Ok(JobRecord {
        job_id,
        queue: queue.to_string(),
        envelope,
        options,
        status,
        attempts_made: required_u64(fields, "attempts")? as u32,
        created_at: parse_millis_field(fields, "created_at").unwrap_or_default(),
        updated_at: parse_millis_field(fields, "updated_at").unwrap_or_default(),
        last_error,
        claim_token: fields.get("claim_token").map(|t| ClaimToken::from(t.as_str())),
        claim_until: parse_millis_field(fields, "claim_until"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_hash_roundtrip() {
        let envelope = TaskEnvelope::new("s1", "u1", "m1", "hello", "2025-01-01T00:00:00Z");
        let mut fields = HashMap::new();
        fields.insert(
            "envelope".to_string(),
            serde_json::to_string(&envelope).unwrap(),
        );
        fields.insert("status".to_string(), "retrying".to_string());
        fields.insert("attempts".to_string(), "2".to_string());
        fields.insert("max_attempts".to_string(), "3".to_string());
        fields.insert("backoff_kind".to_string(), "exponential".to_string());
        fields.insert("backoff_delay_ms".to_string(), "2000".to_string());
        fields.insert("retain_completed_age_ms".to_string(), "3600000".to_string());
        fields.insert("retain_completed_count".to_string(), "1000".to_string());
        fields.insert("retain_failed_age_ms".to_string(), "86400000".to_string());
        fields.insert("retain_failed_count".to_string(), "5000".to_string());
        fields.insert("retry_at".to_string(), "1735689600000".to_string());
        fields.insert("created_at".to_string(), "1735689500000".to_string());
        fields.insert("updated_at".to_string(), "1735689550000".to_string());
        fields.insert("last_error".to_string(), "503 overloaded".to_string());

        let record = record_from_hash(JobId::from("j1"), "ai-tasks", &fields).unwrap();

        assert_eq!(record.attempts_made, 2);
        assert_eq!(record.options.attempts, 3);
        assert_eq!(record.envelope, envelope);
        assert!(matches!(record.status, JobStatus::Retrying { .. }));
        assert_eq!(record.last_error.as_deref(), Some("503 overloaded"));
    }

    #[test]
    fn test_missing_hash_field_is_storage_error() {
        let fields = HashMap::new();
        let result = record_from_hash(JobId::from("j1"), "ai-tasks", &fields);
        assert!(matches!(result, Err(RelayError::Storage(_))));
    }
}
