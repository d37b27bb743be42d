//! Job message broker.
//!
//! [`JobQueue`] is the broker contract the worker pool consumes: at-least-once
//! delivery, leases with heartbeats, exponential-backoff retries and
//! state-aware removal. [`RedisQueue`] implements it with one atomic Lua
//! script per state transition; `memory_queue::MemoryQueue` mirrors the same
//! semantics in process.
//!
//! Redis layout under `{prefix}`:
//! - `:wait` list of job ids (LPUSH in, RPOP out)
//! - `:delayed` zset scored by ready-at millis
//! - `:active` zset scored by lease deadline millis
//! - `:completed`, `:failed` zsets scored by finish millis
//! - `:msg:{id}` hash with `payload`, `state`, `attempts_made`, `stalled_count`, `error`

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::job::{JobParams, JobType};

/// Payload handed from the broker to the worker pool.
///
/// A pointer to the job, not a copy of truth: handlers re-read the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub job_type: JobType,
    /// Request parameters as they were at enqueue time.
    pub params: JobParams,
    pub user_id: Option<String>,
}

/// A reserved message together with its delivery count (1 on first delivery).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub attempts_made: u32,
}

/// Broker-side state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Result of acknowledging a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    /// The message was removed or force-failed while it was being processed.
    Superseded,
}

/// Result of reporting a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt after `delay`.
    Retrying { delay: Duration },
    /// No attempts left (or not retryable); the message is dead.
    Exhausted,
    Superseded,
}

/// Messages moved by a stalled-lease sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledSweep {
    pub recovered: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Broker-level retry policy: `max_attempts` deliveries in total, waiting
/// `initial_backoff * 2^(attempt - 1)` after each failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next delivery, after `attempts_made` failed deliveries.
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exponent)
    }

    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Re-enqueueing a job that is still pending is a no-op.
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Take the oldest ready message and hold it for `lease`.
    async fn reserve(&self, lease: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn heartbeat(&self, job_id: Uuid, lease: Duration) -> Result<(), QueueError>;

    async fn complete(&self, delivery: &Delivery) -> Result<AckOutcome, QueueError>;

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// Hand a delivery back without consuming an attempt.
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Remove a job, branching on its broker state.
    async fn remove_job(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Requeue active messages whose lease expired.
    async fn recover_stalled(&self, max_stalled: u32) -> Result<StalledSweep, QueueError>;

    async fn state(&self, job_id: Uuid) -> Result<Option<MessageState>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue connection closed: {0}")]
    Closed(String),

    #[error("Corrupt queue entry {0}")]
    Corrupt(String),
}

impl QueueError {
    /// Whether the consumer lost its broker connection.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            QueueError::Closed(_) => true,
            _ => false,
        }
    }
}

const ENQUEUE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[2], 'state')
if state == 'waiting' or state == 'delayed' or state == 'active' then
  return 0
end
redis.call('ZREM', KEYS[3], ARGV[2])
redis.call('ZREM', KEYS[4], ARGV[2])
redis.call('DEL', KEYS[2])
redis.call('HSET', KEYS[2], 'payload', ARGV[1], 'state', 'waiting', 'attempts_made', 0, 'stalled_count', 0)
redis.call('LPUSH', KEYS[1], ARGV[2])
return 1
"#;

const RESERVE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('LPUSH', KEYS[1], id)
  redis.call('HSET', ARGV[3] .. id, 'state', 'waiting')
end
while true do
  local id = redis.call('RPOP', KEYS[1])
  if not id then
    return false
  end
  local key = ARGV[3] .. id
  local payload = redis.call('HGET', key, 'payload')
  if payload then
    redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
    redis.call('HSET', key, 'state', 'active')
    local attempts = redis.call('HINCRBY', key, 'attempts_made', 1)
    return {id, payload, attempts}
  end
end
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') ~= 'active' then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[3]))
redis.call('HSET', KEYS[3], 'state', 'completed', 'finished_at', ARGV[1])
redis.call('PEXPIRE', KEYS[3], ARGV[3])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], 'state') ~= 'active' then
  return 'gone'
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[4], 'error', ARGV[3])
if ARGV[4] == '1' then
  redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[5]), ARGV[2])
  redis.call('HSET', KEYS[4], 'state', 'delayed')
  return 'retrying'
end
redis.call('ZADD', KEYS[3], ARGV[1], ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[6]))
redis.call('HSET', KEYS[4], 'state', 'failed', 'finished_at', ARGV[1])
redis.call('PEXPIRE', KEYS[4], ARGV[6])
return 'failed'
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') ~= 'active' then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HINCRBY', KEYS[3], 'attempts_made', -1)
redis.call('HSET', KEYS[3], 'state', 'waiting')
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

const FORCE_FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') ~= 'active' then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[4]))
redis.call('HSET', KEYS[3], 'state', 'failed', 'error', ARGV[3], 'finished_at', ARGV[1])
redis.call('PEXPIRE', KEYS[3], ARGV[4])
return 1
"#;

const PURGE_SCRIPT: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
return redis.call('DEL', KEYS[6])
"#;

const RECOVER_STALLED_SCRIPT: &str = r#"
local stalled = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local recovered = {}
local dead = {}
for _, id in ipairs(stalled) do
  local key = ARGV[2] .. id
  redis.call('ZREM', KEYS[1], id)
  local count = redis.call('HINCRBY', key, 'stalled_count', 1)
  if count > tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[3], ARGV[1], id)
    redis.call('HSET', key, 'state', 'failed', 'error', 'job stalled more than allowable limit', 'finished_at', ARGV[1])
    redis.call('PEXPIRE', key, ARGV[4])
    table.insert(dead, id)
  else
    redis.call('LPUSH', KEYS[2], id)
    redis.call('HSET', key, 'state', 'waiting')
    table.insert(recovered, id)
  end
end
redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[4]))
return {recovered, dead}
"#;

/// Redis-backed broker.
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
    retry: RetryPolicy,
    retention: Duration,
    enqueue_script: Script,
    reserve_script: Script,
    complete_script: Script,
    fail_script: Script,
    release_script: Script,
    force_fail_script: Script,
    purge_script: Script,
    recover_stalled_script: Script,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_id(raw: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(raw).map_err(|_| QueueError::Corrupt(raw.to_string()))
}

impl RedisQueue {
    pub fn new(redis_url: &str, prefix: &str, retry: RetryPolicy) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches(':').to_string(),
            retry,
            retention: Duration::from_secs(24 * 60 * 60),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            force_fail_script: Script::new(FORCE_FAIL_SCRIPT),
            purge_script: Script::new(PURGE_SCRIPT),
            recover_stalled_script: Script::new(RECOVER_STALLED_SCRIPT),
        })
    }

    /// How long finished messages are kept for inspection.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn msg_prefix(&self) -> String {
        format!("{}:msg:", self.prefix)
    }

    fn msg_key(&self, job_id: Uuid) -> String {
        format!("{}{}", self.msg_prefix(), job_id)
    }

    fn retention_millis(&self) -> u64 {
        self.retention.as_millis() as u64
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Force an active message into the failed set. False if it was no longer active.
    async fn force_fail(&self, job_id: Uuid, reason: &str) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let moved: i64 = self
            .force_fail_script
            .key(self.key("active"))
            .key(self.key("failed"))
            .key(self.msg_key(job_id))
            .arg(now_millis())
            .arg(job_id.to_string())
            .arg(reason)
            .arg(self.retention_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    /// Delete every trace of a message regardless of state.
    async fn purge(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        self.purge_script
            .key(self.key("wait"))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .key(self.key("completed"))
            .key(self.key("failed"))
            .key(self.msg_key(job_id))
            .arg(job_id.to_string())
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.connection().await?;
        let added: i64 = self
            .enqueue_script
            .key(self.key("wait"))
            .key(self.msg_key(message.job_id))
            .key(self.key("completed"))
            .key(self.key("failed"))
            .arg(payload)
            .arg(message.job_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if added == 0 {
            tracing::debug!(job_id = %message.job_id, "Job already queued, enqueue skipped");
        }
        Ok(())
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let reserved: Option<(String, String, u32)> = self
            .reserve_script
            .key(self.key("wait"))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .arg(now_millis())
            .arg(lease.as_millis() as u64)
            .arg(self.msg_prefix())
            .invoke_async(&mut conn)
            .await?;

        match reserved {
            Some((id, payload, attempts_made)) => {
                let message: QueueMessage = serde_json::from_str(&payload)
                    .map_err(|_| QueueError::Corrupt(id.clone()))?;
                Ok(Some(Delivery {
                    message,
                    attempts_made,
                }))
            }
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, job_id: Uuid, lease: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let deadline = now_millis() + lease.as_millis() as i64;
        redis::cmd("ZADD")
            .arg(self.key("active"))
            .arg("XX")
            .arg(deadline)
            .arg(job_id.to_string())
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete(&self, delivery: &Delivery) -> Result<AckOutcome, QueueError> {
        let job_id = delivery.message.job_id;
        let mut conn = self.connection().await?;
        let moved: i64 = self
            .complete_script
            .key(self.key("active"))
            .key(self.key("completed"))
            .key(self.msg_key(job_id))
            .arg(now_millis())
            .arg(job_id.to_string())
            .arg(self.retention_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(if moved == 1 {
            AckOutcome::Acknowledged
        } else {
            AckOutcome::Superseded
        })
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let job_id = delivery.message.job_id;
        let retry = retryable && self.retry.allows_retry(delivery.attempts_made);
        let delay = self.retry.backoff_for(delivery.attempts_made);

        let mut conn = self.connection().await?;
        let outcome: String = self
            .fail_script
            .key(self.key("active"))
            .key(self.key("delayed"))
            .key(self.key("failed"))
            .key(self.msg_key(job_id))
            .arg(now_millis())
            .arg(job_id.to_string())
            .arg(error)
            .arg(if retry { "1" } else { "0" })
            .arg(delay.as_millis() as u64)
            .arg(self.retention_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(match outcome.as_str() {
            "retrying" => FailOutcome::Retrying { delay },
            "failed" => FailOutcome::Exhausted,
            _ => FailOutcome::Superseded,
        })
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let job_id = delivery.message.job_id;
        let mut conn = self.connection().await?;
        self.release_script
            .key(self.key("active"))
            .key(self.key("wait"))
            .key(self.msg_key(job_id))
            .arg(job_id.to_string())
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_job(&self, job_id: Uuid) -> Result<(), QueueError> {
        match self.state(job_id).await? {
            None => Ok(()),
            Some(MessageState::Waiting | MessageState::Delayed) => self.purge(job_id).await,
            Some(MessageState::Active) => {
                if self.force_fail(job_id, "job cancelled").await? {
                    return Ok(());
                }
                // Finished on its own between the state read and the transition.
                tracing::debug!(job_id = %job_id, "Active job settled during removal, purging");
                self.purge(job_id).await
            }
            Some(MessageState::Completed | MessageState::Failed) => {
                if let Err(e) = self.purge(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not clean up finished job");
                }
                Ok(())
            }
        }
    }

    async fn recover_stalled(&self, max_stalled: u32) -> Result<StalledSweep, QueueError> {
        let mut conn = self.connection().await?;
        let (recovered, failed): (Vec<String>, Vec<String>) = self
            .recover_stalled_script
            .key(self.key("active"))
            .key(self.key("wait"))
            .key(self.key("failed"))
            .arg(now_millis())
            .arg(self.msg_prefix())
            .arg(max_stalled)
            .arg(self.retention_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(StalledSweep {
            recovered: recovered.iter().map(|id| parse_id(id)).collect::<Result<_, _>>()?,
            failed: failed.iter().map(|id| parse_id(id)).collect::<Result<_, _>>()?,
        })
    }

    async fn state(&self, job_id: Uuid) -> Result<Option<MessageState>, QueueError> {
        let mut conn = self.connection().await?;
        let state: Option<String> = conn.hget(self.msg_key(job_id), "state").await?;
        state
            .map(|s| s.parse::<MessageState>().map_err(|_| QueueError::Corrupt(s)))
            .transpose()
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.connection().await?;
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .llen(self.key("wait"))
            .zcard(self.key("delayed"))
            .zcard(self.key("active"))
            .zcard(self.key("completed"))
            .zcard(self.key("failed"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}
