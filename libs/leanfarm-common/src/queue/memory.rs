use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::{lease_claimed, lease_expiry_exhausted, settle, Completion, JobQueue, QueueDepth, QueueError, Settlement};
use crate::backoff::RetryPolicy;
use crate::types::{Job, JobStatus, Lease, LeasedJob};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// (ready_at, job id)
    pending: Vec<(DateTime<Utc>, Uuid)>,
    leases: HashMap<Uuid, Lease>,
    /// (dead-lettered at, job id)
    dead: Vec<(DateTime<Utc>, Uuid)>,
    claims: HashMap<Uuid, u32>,
}

impl Inner {
    fn check_lease(&self, lease: &Lease) -> Result<(), QueueError> {
        match self.leases.get(&lease.job_id) {
            Some(current) if current.token == lease.token => Ok(()),
            _ => Err(QueueError::LeaseLost {
                job_id: lease.job_id,
            }),
        }
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.job_id)
            .collect();
        for job_id in expired {
            self.leases.remove(&job_id);
            self.pending.push((now, job_id));
        }
    }
}

/// In-process queue with the same lease semantics as the Redis queue
/// Used by tests and single-process development setups
#[derive(Debug)]
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    lease_ttl: Duration,
    max_attempts: u32,
    retry: RetryPolicy,
}

impl MemoryJobQueue {
    pub fn new(lease_ttl: Duration, max_attempts: u32, retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease_ttl,
            max_attempts,
            retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many times a job has been handed to a claimant
    pub fn claim_count(&self, job_id: Uuid) -> u32 {
        self.lock().claims.get(&job_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        if job.status != JobStatus::Pending {
            return Err(QueueError::UnexpectedStatus {
                job_id: job.id,
                actual: job.status,
                expected: JobStatus::Pending,
            });
        }
        let mut inner = self.lock();
        inner.jobs.insert(job.id, job.clone());
        inner.pending.push((Utc::now(), job.id));
        Ok(())
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();
        inner.reclaim_expired(now);

        loop {
            let next = inner
                .pending
                .iter()
                .enumerate()
                .filter(|(_, (ready_at, _))| *ready_at <= now)
                .min_by_key(|(_, (ready_at, _))| *ready_at)
                .map(|(index, _)| index);
            let Some(index) = next else {
                return Ok(None);
            };
            let (_, job_id) = inner.pending.remove(index);

            let job = inner.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
            lease_claimed(job, worker_id)?;
            let mut job = job.clone();
            let lease = Lease::new(job_id, worker_id, self.lease_ttl, now);
            *inner.claims.entry(job_id).or_default() += 1;

            if let Some(completion) = lease_expiry_exhausted(&job, self.max_attempts) {
                settle(&mut job, &lease, completion, self.max_attempts, &self.retry, now)?;
                inner.dead.push((now, job_id));
                inner.jobs.insert(job_id, job);
                continue;
            }
            inner.jobs.insert(job_id, job.clone());
            inner.leases.insert(job_id, lease.clone());
            return Ok(Some(LeasedJob { job, lease }));
        }
    }

    async fn mark_running(&self, leased: &mut LeasedJob) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.check_lease(&leased.lease)?;
        leased.job.transition(JobStatus::Running)?;
        inner.jobs.insert(leased.job.id, leased.job.clone());
        Ok(())
    }

    async fn heartbeat(&self, lease: &mut Lease) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.check_lease(lease)?;
        lease.expires_at = Utc::now() + crate::types::to_chrono(self.lease_ttl);
        inner.leases.insert(lease.job_id, lease.clone());
        Ok(())
    }

    async fn complete(&self, leased: LeasedJob, completion: Completion) -> Result<Settlement, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();
        inner.check_lease(&leased.lease)?;

        let LeasedJob { mut job, lease } = leased;
        let settlement = settle(&mut job, &lease, completion, self.max_attempts, &self.retry, now)?;
        inner.leases.remove(&job.id);
        match settlement {
            Settlement::Requeued { ready_at } => inner.pending.push((ready_at, job.id)),
            Settlement::DeadLettered => inner.dead.push((now, job.id)),
            Settlement::Succeeded => {}
        }
        inner.jobs.insert(job.id, job);
        Ok(settlement)
    }

    async fn release(&self, leased: LeasedJob) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();
        inner.check_lease(&leased.lease)?;

        let mut job = leased.job;
        job.transition(JobStatus::Pending)?;
        inner.leases.remove(&job.id);
        inner.pending.push((now, job.id));
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let inner = self.lock();
        Ok(QueueDepth {
            pending: inner.pending.len() as u64,
            leased: inner.leases.len() as u64,
            dead_lettered: inner.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let inner = self.lock();
        let mut dead = inner.dead.clone();
        dead.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dead
            .into_iter()
            .take(limit)
            .filter_map(|(_, id)| inner.jobs.get(&id).cloned())
            .collect())
    }

    async fn redrive(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.redrive()?;
        let job = job.clone();
        inner.dead.retain(|(_, id)| *id != job_id);
        inner.pending.push((Utc::now(), job_id));
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKey;
    use crate::types::{ExecutionResult, FailureReason, ResourceRequest};

    fn queue(lease_ttl: Duration, max_attempts: u32) -> MemoryJobQueue {
        MemoryJobQueue::new(
            lease_ttl,
            max_attempts,
            RetryPolicy::new(Duration::ZERO, Duration::ZERO, max_attempts),
        )
    }

    fn job() -> Job {
        Job::new(
            ArtifactKey::for_content("leanfarm", b"bundle"),
            vec!["lake".into(), "build".into()],
            ResourceRequest {
                cpu_cores: 1.0,
                memory_bytes: 512 * 1024 * 1024,
                timeout_seconds: Some(30),
            },
        )
    }

    fn failure() -> Completion {
        Completion::Failed {
            reason: FailureReason::SandboxFailure {
                exit_code: Some(1),
                message: "lake build failed".into(),
            },
            result: None,
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = queue(Duration::from_secs(30), 3);
        let job = job();
        queue.enqueue(&job).await.unwrap();

        let leased = queue.claim_next("a").await.unwrap().unwrap();
        assert_eq!(leased.job.id, job.id);
        assert_eq!(leased.job.status, JobStatus::Leased);
        assert!(queue.claim_next("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_success_lifecycle() {
        let queue = queue(Duration::from_secs(30), 3);
        queue.enqueue(&job()).await.unwrap();

        let mut leased = queue.claim_next("a").await.unwrap().unwrap();
        queue.mark_running(&mut leased).await.unwrap();
        let id = leased.job.id;
        let settlement = queue
            .complete(leased, Completion::Succeeded(ExecutionResult::default()))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Succeeded);
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_heartbeat_after_reassignment_is_lease_lost() {
        let queue = queue(Duration::from_millis(20), 3);
        queue.enqueue(&job()).await.unwrap();

        let stale = queue.claim_next("a").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = queue.claim_next("b").await.unwrap().unwrap();
        assert_eq!(fresh.job.id, stale.job.id);

        let mut stale_lease = stale.lease.clone();
        assert!(matches!(
            queue.heartbeat(&mut stale_lease).await,
            Err(QueueError::LeaseLost { .. })
        ));
        assert!(matches!(
            queue.complete(stale, failure()).await,
            Err(QueueError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let queue = queue(Duration::from_millis(60), 3);
        queue.enqueue(&job()).await.unwrap();
        let mut leased = queue.claim_next("a").await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            queue.heartbeat(&mut leased.lease).await.unwrap();
        }
        assert!(queue.claim_next("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_attempts_dead_letters_and_never_reclaimed() {
        let queue = queue(Duration::from_secs(30), 3);
        let job = job();
        queue.enqueue(&job).await.unwrap();

        for _ in 0..3 {
            let mut leased = queue.claim_next("a").await.unwrap().unwrap();
            queue.mark_running(&mut leased).await.unwrap();
            queue.complete(leased, failure()).await.unwrap();
        }

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::DeadLettered);
        assert_eq!(stored.history.len(), 3);
        assert!(queue.claim_next("a").await.unwrap().is_none());
        assert_eq!(queue.claim_count(job.id), 3);
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_leases_eventually_dead_letter() {
        let queue = queue(Duration::from_millis(10), 2);
        let job = job();
        queue.enqueue(&job).await.unwrap();

        for _ in 0..2 {
            let mut leased = queue.claim_next("crashing").await.unwrap().unwrap();
            queue.mark_running(&mut leased).await.unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(queue.claim_next("a").await.unwrap().is_none());

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::DeadLettered);
        assert_eq!(stored.last_failure, Some(FailureReason::LeaseExpired { expirations: 2 }));
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_does_not_consume_attempt() {
        let queue = queue(Duration::from_secs(30), 3);
        queue.enqueue(&job()).await.unwrap();

        let mut leased = queue.claim_next("a").await.unwrap().unwrap();
        queue.mark_running(&mut leased).await.unwrap();
        queue.release(leased).await.unwrap();

        let again = queue.claim_next("b").await.unwrap().unwrap();
        assert_eq!(again.job.attempts, 0);
        assert!(again.job.history.is_empty());
    }

    #[tokio::test]
    async fn test_redrive_resets_attempts() {
        let queue = queue(Duration::from_secs(30), 1);
        let job = job();
        queue.enqueue(&job).await.unwrap();
        let mut leased = queue.claim_next("a").await.unwrap().unwrap();
        queue.mark_running(&mut leased).await.unwrap();
        assert_eq!(
            queue.complete(leased, failure()).await.unwrap(),
            Settlement::DeadLettered
        );

        let redriven = queue.redrive(job.id).await.unwrap();
        assert_eq!(redriven.status, JobStatus::Pending);
        assert_eq!(redriven.attempts, 0);
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
        assert!(queue.claim_next("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_requeue_waits_for_backoff() {
        let queue = MemoryJobQueue::new(
            Duration::from_secs(30),
            3,
            RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60), 3),
        );
        queue.enqueue(&job()).await.unwrap();
        let mut leased = queue.claim_next("a").await.unwrap().unwrap();
        queue.mark_running(&mut leased).await.unwrap();
        queue.complete(leased, failure()).await.unwrap();

        assert!(queue.claim_next("a").await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap().pending, 1);
    }
}
