//! Durable job storage.
//!
//! `JobStore` is the source of truth for job state. The Status API reads it directly,
//! so nothing about a job's outcome may live only in worker memory.
//!
//! Redis layout:
//! - `job:{id}`           JSON-encoded `Job` record
//! - `job:{id}:lease`     owner token of the process currently running the job
//! - `sales_message:{id}` generated text of a completed job
//! - `jobs:pending`       set of ids that have not reached a terminal state
//!
//! Record and result keys expire after the configured retention. Leases expire on
//! their own so a crashed owner cannot block a job forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use tracing::{info, warn};

use crate::jobs::model::{InvalidTransition, Job, JobId, JobState};

const PENDING_SET: &str = "jobs:pending";

// Refuses to replace a terminal record. KEYS: record, pending set.
// ARGV: record json, ttl secs, "1" if the new record is terminal, id.
const SAVE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local state = cjson.decode(current)['state']
  if state == 'completed' or state == 'failed' then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
if ARGV[3] == '1' then
  redis.call('SREM', KEYS[2], ARGV[4])
else
  redis.call('SADD', KEYS[2], ARGV[4])
end
return 1
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("job {0} has already reached a terminal state")]
    AlreadyTerminal(JobId),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Writes the job record and keeps the pending set in step with it, atomically.
    /// A record that is already terminal is never replaced: the write fails with
    /// `StoreError::AlreadyTerminal`.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    async fn load(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Stores a generated result. Storing twice for the same id overwrites.
    async fn put(&self, id: JobId, result: &str) -> Result<(), StoreError>;

    /// Reads a stored result.
    async fn get(&self, id: JobId) -> Result<Option<String>, StoreError>;

    async fn get_state(&self, id: JobId) -> Result<Option<JobState>, StoreError> {
        Ok(self.load(id).await?.map(|job| job.state))
    }

    /// Jobs that have not reached a terminal state, oldest first.
    async fn pending(&self) -> Result<Vec<Job>, StoreError>;

    /// Takes the execution lease on a job for `ttl`. Returns `false` while a different
    /// owner holds an unexpired lease.
    async fn acquire_lease(
        &self,
        id: JobId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Gives the lease back. Does nothing if `owner` no longer holds it.
    async fn release_lease(&self, id: JobId, owner: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub fn job_key(id: JobId) -> String {
    format!("job:{id}")
}

pub fn lease_key(id: JobId) -> String {
    format!("job:{id}:lease")
}

pub fn result_key(id: JobId) -> String {
    format!("sales_message:{id}")
}

/// Splits raw pending-set members into live jobs, oldest first, and members to drop:
/// ids that do not parse, records that expired, jobs that are already terminal.
pub(crate) fn sort_pending(entries: Vec<(String, Option<Job>)>) -> (Vec<Job>, Vec<String>) {
    let mut live = Vec::with_capacity(entries.len());
    let mut stale = Vec::new();
    for (raw, job) in entries {
        match job {
            Some(job) if !job.state.is_terminal() && job.id.to_string() == raw => live.push(job),
            _ => stale.push(raw),
        }
    }
    live.sort_by_key(|job: &Job| job.created_at);
    (live, stale)
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    retention: Duration,
    save_script: Arc<Script>,
    release_script: Arc<Script>,
}

impl RedisJobStore {
    pub async fn connect(url: &str, retention: Duration) -> Result<Self, StoreError> {
        info!("Connecting to Redis...");
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let store = Self {
            conn,
            retention,
            save_script: Arc::new(Script::new(SAVE_SCRIPT)),
            release_script: Arc::new(Script::new(RELEASE_LEASE_SCRIPT)),
        };
        store.ping().await?;
        info!("Redis connection established");
        Ok(store)
    }

    fn ttl_secs(&self) -> u64 {
        self.retention.as_secs().max(1)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let record = serde_json::to_string(job)?;
        let terminal = if job.state.is_terminal() { "1" } else { "0" };

        let mut conn = self.conn.clone();
        let written: i64 = self
            .save_script
            .key(job_key(job.id))
            .key(PENDING_SET)
            .arg(record)
            .arg(self.ttl_secs())
            .arg(terminal)
            .arg(job.id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if written == 0 {
            return Err(StoreError::AlreadyTerminal(job.id));
        }
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let record: Option<String> = conn.get(job_key(id)).await?;
        record
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn put(&self, id: JobId, result: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(result_key(id))
            .arg(result)
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(result_key(id)).await?)
    }

    async fn pending(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(PENDING_SET).await?;

        let mut entries = Vec::with_capacity(ids.len());
        for raw in ids {
            let job = match raw.parse::<JobId>() {
                Ok(id) => self.load(id).await?,
                Err(_) => None,
            };
            entries.push((raw, job));
        }

        let (jobs, stale) = sort_pending(entries);
        for raw in stale {
            warn!(job_id = %raw, "dropping stale pending entry");
            conn.srem::<_, _, ()>(PENDING_SET, &raw).await?;
        }
        Ok(jobs)
    }

    async fn acquire_lease(
        &self,
        id: JobId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let granted: Option<String> = redis::cmd("SET")
            .arg(lease_key(id))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(granted.is_some())
    }

    async fn release_lease(&self, id: JobId, owner: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.release_script
            .key(lease_key(id))
            .arg(owner)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
