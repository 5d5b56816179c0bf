use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{lease_claimed, lease_expiry_exhausted, millis, settle, Completion, JobQueue, QueueDepth, QueueError, Settlement};
use crate::backoff::RetryPolicy;
use crate::redis::QueueKeys;
use crate::types::{to_chrono, Job, JobStatus, Lease, LeasedJob};

/// Expired leases are put back before a claim, a bounded batch at a time
const RECLAIM_BATCH: usize = 16;

// KEYS: pending, leased
// ARGV: now_ms, expires_ms, token, job prefix, lease prefix, reclaim batch
const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[6]))
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('DEL', ARGV[5] .. ':' .. id)
  redis.call('ZADD', KEYS[1], ARGV[1], id)
end
while true do
  local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
  if #ready == 0 then
    return false
  end
  local id = ready[1]
  redis.call('ZREM', KEYS[1], id)
  local body = redis.call('GET', ARGV[4] .. ':' .. id)
  if body then
    redis.call('SET', ARGV[5] .. ':' .. id, ARGV[3])
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    return {id, body}
  end
end
"#;

// KEYS: lease, leased
// ARGV: token, expires_ms, id
const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

// KEYS: lease, job, pending, leased, dead
// ARGV: token, job json, action, score, id
const UPDATE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[2], ARGV[2])
local action = ARGV[3]
if action ~= 'keep' then
  redis.call('DEL', KEYS[1])
  redis.call('ZREM', KEYS[4], ARGV[5])
  if action == 'requeue' then
    redis.call('ZADD', KEYS[3], ARGV[4], ARGV[5])
  elseif action == 'deadletter' then
    redis.call('ZADD', KEYS[5], ARGV[4], ARGV[5])
  end
end
return 1
"#;

/// What the update script does after writing the record
#[derive(Debug, Clone, Copy)]
enum Update {
    /// Record only, lease stays
    Keep,
    Requeue { ready_at_ms: i64 },
    DeadLetter { at_ms: i64 },
    /// Terminal success, lease dropped
    Finish,
}

impl Update {
    fn action(self) -> (&'static str, i64) {
        match self {
            Update::Keep => ("keep", 0),
            Update::Requeue { ready_at_ms } => ("requeue", ready_at_ms),
            Update::DeadLetter { at_ms } => ("deadletter", at_ms),
            Update::Finish => ("finish", 0),
        }
    }
}

struct Scripts {
    claim: Script,
    heartbeat: Script,
    update: Script,
}

/// Redis-backed queue
/// Claims, heartbeats and settlements are Lua scripts, so each one is atomic
/// with respect to every other worker
pub struct RedisJobQueue {
    conn: ConnectionManager,
    scripts: Scripts,
    keys: QueueKeys,
    lease_ttl: Duration,
    max_attempts: u32,
    retry: RetryPolicy,
}

impl RedisJobQueue {
    pub async fn connect(
        redis_url: &str,
        lease_ttl: Duration,
        max_attempts: u32,
        retry: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis job queue");

        Ok(Self {
            conn,
            scripts: Scripts {
                claim: Script::new(CLAIM_SCRIPT),
                heartbeat: Script::new(HEARTBEAT_SCRIPT),
                update: Script::new(UPDATE_SCRIPT),
            },
            keys: QueueKeys::default(),
            lease_ttl,
            max_attempts,
            retry,
        })
    }

    /// Keep every key under `namespace` instead of the default one
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.keys = QueueKeys::new(namespace);
        self
    }

    /// Write the record under the lease and apply `update`
    async fn write_guarded(&self, job: &Job, lease: &Lease, update: Update) -> Result<(), QueueError> {
        let body = serde_json::to_string(job)?;
        let (action, score) = update.action();
        let mut conn = self.conn.clone();

        let mut invocation = self.scripts.update.prepare_invoke();
        invocation
            .key(self.keys.lease(&job.id))
            .key(self.keys.job(&job.id))
            .key(&self.keys.pending)
            .key(&self.keys.leased)
            .key(&self.keys.dead_letter)
            .arg(&lease.token)
            .arg(body)
            .arg(action)
            .arg(score)
            .arg(job.id.to_string());
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        if applied == 0 {
            return Err(QueueError::LeaseLost { job_id: job.id });
        }
        Ok(())
    }

    async fn load(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn.get(self.keys.job(&job_id)).await?;
        body.map(|b| serde_json::from_str(&b).map_err(QueueError::from))
            .transpose()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        if job.status != JobStatus::Pending {
            return Err(QueueError::UnexpectedStatus {
                job_id: job.id,
                actual: job.status,
                expected: JobStatus::Pending,
            });
        }
        let body = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(self.keys.job(&job.id), body)
            .ignore()
            .zadd(&self.keys.pending, job.id.to_string(), millis(Utc::now()))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(job_id = %job.id, "Enqueued job");
        Ok(())
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError> {
        loop {
            let now = Utc::now();
            let lease = Lease::new(Uuid::nil(), worker_id, self.lease_ttl, now);
            let mut conn = self.conn.clone();

            let mut invocation = self.scripts.claim.prepare_invoke();
            invocation
                .key(&self.keys.pending)
                .key(&self.keys.leased)
                .arg(millis(now))
                .arg(millis(lease.expires_at))
                .arg(&lease.token)
                .arg(&self.keys.job_prefix)
                .arg(&self.keys.lease_prefix)
                .arg(RECLAIM_BATCH);
            let claimed: Option<(String, String)> = invocation.invoke_async(&mut conn).await?;
            let Some((id, body)) = claimed else {
                return Ok(None);
            };

            let job_id =
                Uuid::parse_str(&id).map_err(|e| QueueError::Corrupt(format!("job id {:?}: {}", id, e)))?;
            let mut job: Job = serde_json::from_str(&body)?;
            lease_claimed(&mut job, worker_id)?;
            let lease = Lease { job_id, ..lease };

            if let Some(completion) = lease_expiry_exhausted(&job, self.max_attempts) {
                settle(&mut job, &lease, completion, self.max_attempts, &self.retry, now)?;
                self.write_guarded(&job, &lease, Update::DeadLetter { at_ms: millis(now) })
                    .await?;
                warn!(
                    job_id = %job_id,
                    expirations = job.expired_leases,
                    "Dead-lettered job whose leases keep expiring"
                );
                continue;
            }

            self.write_guarded(&job, &lease, Update::Keep).await?;
            debug!(job_id = %job_id, worker_id, "Claimed job");
            return Ok(Some(LeasedJob { job, lease }));
        }
    }

    async fn mark_running(&self, leased: &mut LeasedJob) -> Result<(), QueueError> {
        leased.job.transition(JobStatus::Running)?;
        self.write_guarded(&leased.job, &leased.lease, Update::Keep).await
    }

    async fn heartbeat(&self, lease: &mut Lease) -> Result<(), QueueError> {
        let expires_at = Utc::now() + to_chrono(self.lease_ttl);
        let mut conn = self.conn.clone();

        let mut invocation = self.scripts.heartbeat.prepare_invoke();
        invocation
            .key(self.keys.lease(&lease.job_id))
            .key(&self.keys.leased)
            .arg(&lease.token)
            .arg(millis(expires_at))
            .arg(lease.job_id.to_string());
        let extended: i64 = invocation.invoke_async(&mut conn).await?;
        if extended == 0 {
            return Err(QueueError::LeaseLost {
                job_id: lease.job_id,
            });
        }
        lease.expires_at = expires_at;
        Ok(())
    }

    async fn complete(&self, leased: LeasedJob, completion: Completion) -> Result<Settlement, QueueError> {
        let now = Utc::now();
        let LeasedJob { mut job, lease } = leased;
        let settlement = settle(&mut job, &lease, completion, self.max_attempts, &self.retry, now)?;
        let update = match settlement {
            Settlement::Succeeded => Update::Finish,
            Settlement::Requeued { ready_at } => Update::Requeue {
                ready_at_ms: millis(ready_at),
            },
            Settlement::DeadLettered => Update::DeadLetter { at_ms: millis(now) },
        };
        self.write_guarded(&job, &lease, update).await?;
        Ok(settlement)
    }

    async fn release(&self, leased: LeasedJob) -> Result<(), QueueError> {
        let LeasedJob { mut job, lease } = leased;
        job.transition(JobStatus::Pending)?;
        self.write_guarded(
            &job,
            &lease,
            Update::Requeue {
                ready_at_ms: millis(Utc::now()),
            },
        )
        .await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        self.load(job_id).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.conn.clone();
        let (pending, leased, dead_lettered): (u64, u64, u64) = redis::pipe()
            .zcard(&self.keys.pending)
            .zcard(&self.keys.leased)
            .zcard(&self.keys.dead_letter)
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            pending,
            leased,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(&self.keys.dead_letter, 0, limit as isize - 1)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id = Uuid::parse_str(&id).map_err(|e| QueueError::Corrupt(format!("job id {:?}: {}", id, e)))?;
            if let Some(job) = self.load(job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn redrive(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let mut job = self.load(job_id).await?.ok_or(QueueError::NotFound(job_id))?;
        if job.status != JobStatus::DeadLettered {
            return Err(QueueError::UnexpectedStatus {
                job_id,
                actual: job.status,
                expected: JobStatus::DeadLettered,
            });
        }
        job.redrive()?;

        let body = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zrem(&self.keys.dead_letter, job_id.to_string())
            .ignore()
            .set(self.keys.job(&job_id), body)
            .ignore()
            .zadd(&self.keys.pending, job_id.to_string(), millis(Utc::now()))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        info!(job_id = %job_id, "Redrove dead-lettered job");
        Ok(job)
    }
}
