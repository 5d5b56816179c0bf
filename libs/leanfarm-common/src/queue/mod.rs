//! Job Queue Client
//!
//! claim / heartbeat / complete over a durable at-least-once queue. The
//! lease is the only cross-process coordination primitive: every write made
//! on behalf of a claimant is guarded by its lease token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::types::{
    to_chrono, AttemptOutcome, AttemptRecord, ExecutionResult, FailureReason, InvalidTransition, Job,
    JobStatus, Lease, LeasedJob,
};

pub mod memory;
pub mod redis_queue;

pub use memory::MemoryJobQueue;
pub use redis_queue::RedisJobQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: Uuid },
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} is {actual}, expected {expected}")]
    UnexpectedStatus {
        job_id: Uuid,
        actual: JobStatus,
        expected: JobStatus,
    },
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("corrupt queue entry: {0}")]
    Corrupt(String),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What a worker reports when it settles an attempt
#[derive(Debug, Clone)]
pub enum Completion {
    Succeeded(ExecutionResult),
    Failed {
        reason: FailureReason,
        result: Option<ExecutionResult>,
    },
}

/// Where a settled job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Succeeded,
    Requeued { ready_at: DateTime<Utc> },
    DeadLettered,
}

impl Settlement {
    pub fn status(&self) -> JobStatus {
        match self {
            Settlement::Succeeded => JobStatus::Succeeded,
            Settlement::Requeued { .. } => JobStatus::Pending,
            Settlement::DeadLettered => JobStatus::DeadLettered,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub leased: u64,
    pub dead_lettered: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Producer side: store a new Pending job, ready immediately
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Atomically lease one ready Pending job; `None` when nothing is ready
    async fn claim_next(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError>;

    /// Persist `Leased -> Running`
    async fn mark_running(&self, leased: &mut LeasedJob) -> Result<(), QueueError>;

    /// Extend the lease; `LeaseLost` once it has been reassigned
    async fn heartbeat(&self, lease: &mut Lease) -> Result<(), QueueError>;

    /// Record the attempt and move the job to its next state
    async fn complete(&self, leased: LeasedJob, completion: Completion) -> Result<Settlement, QueueError>;

    /// Hand the job back without consuming an attempt
    async fn release(&self, leased: LeasedJob) -> Result<(), QueueError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Most recently dead-lettered first
    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Operator path: DeadLettered back to Pending with a fresh attempt budget
    async fn redrive(&self, job_id: Uuid) -> Result<Job, QueueError>;
}

/// Apply a completion to the job record
///
/// **Rules:**
/// - success moves `Running -> Succeeded` and commits the artifact references
/// - a non-retryable failure dead-letters immediately, from Leased or Running
/// - a retryable failure counts one attempt, then either requeues with
///   backoff or dead-letters once `max_attempts` is reached
pub fn settle(
    job: &mut Job,
    lease: &Lease,
    completion: Completion,
    max_attempts: u32,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Settlement, InvalidTransition> {
    let attempt = job.attempts + 1;
    let (settlement, outcome) = match completion {
        Completion::Succeeded(result) => {
            job.transition(JobStatus::Succeeded)?;
            job.artifacts = result.artifacts.clone();
            job.last_result = Some(result);
            job.last_failure = None;
            (Settlement::Succeeded, AttemptOutcome::Succeeded)
        }
        Completion::Failed { reason, result } => {
            if job.status == JobStatus::Leased && !reason.is_retryable() {
                job.transition(JobStatus::DeadLettered)?;
                job.attempts = attempt;
            } else {
                job.transition(JobStatus::Failed)?;
                job.attempts = attempt;
                if !reason.is_retryable() || job.attempts >= max_attempts {
                    job.transition(JobStatus::DeadLettered)?;
                } else {
                    job.transition(JobStatus::Pending)?;
                }
            }
            if result.is_some() {
                job.last_result = result;
            }
            job.last_failure = Some(reason.clone());

            let settlement = if job.status == JobStatus::DeadLettered {
                Settlement::DeadLettered
            } else {
                let delay = retry.delay_for(job.attempts.saturating_sub(1));
                Settlement::Requeued {
                    ready_at: now + to_chrono(delay),
                }
            };
            (settlement, AttemptOutcome::Failed { reason })
        }
    };

    job.history.push(AttemptRecord {
        attempt,
        worker_id: lease.worker_id.clone(),
        started_at: lease.acquired_at,
        finished_at: now,
        outcome,
    });
    job.worker_id = Some(lease.worker_id.clone());
    job.updated_at = now;
    Ok(settlement)
}

/// Bring a freshly claimed record to Leased, undoing a stale claim if needed
pub(crate) fn lease_claimed(job: &mut Job, worker_id: &str) -> Result<(), InvalidTransition> {
    job.reset_stale_claim()?;
    job.transition(JobStatus::Leased)?;
    job.worker_id = Some(worker_id.to_string());
    Ok(())
}

/// A job whose leases expired `max_attempts` times is dead-lettered at claim
/// time instead of being handed to yet another claimant
pub(crate) fn lease_expiry_exhausted(job: &Job, max_attempts: u32) -> Option<Completion> {
    (job.expired_leases >= max_attempts).then(|| Completion::Failed {
        reason: FailureReason::LeaseExpired {
            expirations: job.expired_leases,
        },
        result: None,
    })
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}
