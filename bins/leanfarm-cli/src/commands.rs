// Operator commands against the job queue and artifact store
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use leanfarm_common::artifact::{open_store, put_content};
use leanfarm_common::queue::{QueueDepth, RedisJobQueue};
use leanfarm_common::{
    build_sandbox_spec, ArtifactKey, ArtifactStore, Config, FailureReason, Job, JobQueue, ResourceRequest,
    SecurityPolicy,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub struct SubmitRequest {
    pub bundle: Vec<u8>,
    pub command: Vec<String>,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub timeout_seconds: Option<u64>,
}

/// One line of the dead-letter listing
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterSummary {
    pub id: Uuid,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureReason>,
    pub reason: String,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for DeadLetterSummary {
    fn from(job: Job) -> Self {
        let reason = job
            .last_failure
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |failure| failure.to_string());
        Self {
            id: job.id,
            attempts: job.attempts,
            last_failure: job.last_failure,
            reason,
            updated_at: job.updated_at,
        }
    }
}

pub struct Operator {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ArtifactStore>,
    policy: SecurityPolicy,
    artifact_prefix: String,
}

impl Operator {
    /// Connect with the same configuration the workers load
    pub async fn connect() -> Result<Self> {
        let config = Config::load().context("Invalid configuration")?;
        let policy = SecurityPolicy::from_config(&config).context("Invalid security policy")?;
        let queue = RedisJobQueue::connect(
            &config.redis_url,
            config.lease_ttl,
            config.max_attempts,
            config.retry_policy(),
        )
        .await
        .context("Failed to connect to the Redis job queue")?;
        let store = open_store(&config)
            .await
            .context("Failed to open the artifact store")?;

        Ok(Self {
            queue: Arc::new(queue),
            store,
            policy,
            artifact_prefix: config.artifact_key_prefix,
        })
    }

    /// Validate, upload the bundle, enqueue
    ///
    /// A request the policy would reject is refused here, before anything is
    /// stored, so it never burns a worker slot.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        if request.bundle.is_empty() {
            bail!("Bundle is empty");
        }
        let key = ArtifactKey::for_content(&self.artifact_prefix, &request.bundle);
        let job = Job::new(
            key,
            request.command,
            ResourceRequest {
                cpu_cores: request.cpu_cores,
                memory_bytes: request.memory_bytes,
                timeout_seconds: request.timeout_seconds,
            },
        );
        build_sandbox_spec(&job, &self.policy).context("Job rejected by the security policy")?;

        let stored = put_content(self.store.as_ref(), &self.artifact_prefix, &request.bundle)
            .await
            .context("Failed to upload bundle")?;
        if stored != job.bundle {
            bail!("Bundle key mismatch: expected {}, stored {}", job.bundle, stored);
        }
        self.queue.enqueue(&job).await.context("Failed to enqueue job")?;
        Ok(job)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Job> {
        match self.queue.get(job_id).await.context("Failed to load job")? {
            Some(job) => Ok(job),
            None => bail!("Job {} not found", job_id),
        }
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterSummary>> {
        let jobs = self
            .queue
            .dead_letters(limit)
            .await
            .context("Failed to list dead letters")?;
        Ok(jobs.into_iter().map(DeadLetterSummary::from).collect())
    }

    pub async fn redrive(&self, job_id: Uuid) -> Result<Job> {
        self.queue
            .redrive(job_id)
            .await
            .with_context(|| format!("Failed to redrive job {}", job_id))
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        self.queue.depth().await.context("Failed to read queue depth")
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use leanfarm_common::artifact::MemoryArtifactStore;
    use leanfarm_common::config::NetworkPolicy;
    use leanfarm_common::queue::MemoryJobQueue;
    use leanfarm_common::{Completion, JobStatus, RetryPolicy, SecurityProfile, Settlement};
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn operator() -> (Operator, Arc<MemoryJobQueue>, Arc<MemoryArtifactStore>) {
        let queue = Arc::new(MemoryJobQueue::new(
            Duration::from_secs(30),
            3,
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 3),
        ));
        let store = Arc::new(MemoryArtifactStore::new());
        let operator = Operator {
            queue: queue.clone(),
            store: store.clone(),
            policy: SecurityPolicy {
                profile: SecurityProfile::Local,
                uid: 1000,
                gid: 1000,
                cpu_ceiling_cores: 4.0,
                memory_ceiling_bytes: 1024 * MIB,
                timeout_ceiling: Duration::from_secs(600),
                process_ceiling: 64,
                open_files_ceiling: 256,
                scratch_quota_bytes: 64 * MIB,
                network: NetworkPolicy::DenyAll,
            },
            artifact_prefix: "leanfarm".to_string(),
        };
        (operator, queue, store)
    }

    fn request(cpu_cores: f64) -> SubmitRequest {
        SubmitRequest {
            bundle: b"theorem t : 1 + 1 = 2 := rfl".to_vec(),
            command: vec!["lake".to_string(), "build".to_string()],
            cpu_cores,
            memory_bytes: 512 * MIB,
            timeout_seconds: Some(120),
        }
    }

    #[tokio::test]
    async fn test_submit_stores_bundle_and_enqueues() {
        let (operator, _queue, store) = operator();
        let job = operator.submit(request(1.0)).await.unwrap();

        assert_eq!(store.keys(), vec![job.bundle.clone()]);
        let stored = operator.status(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.command, vec!["lake", "build"]);
        assert_eq!(operator.depth().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_submit_over_ceiling_stores_nothing() {
        let (operator, _queue, store) = operator();
        let err = operator.submit(request(16.0)).await.unwrap_err();

        assert!(format!("{:#}", err).contains("exceeds the ceiling"));
        assert!(store.is_empty());
        assert_eq!(operator.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_status_of_unknown_job_fails() {
        let (operator, _queue, _store) = operator();
        assert!(operator.status(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_dead_letter_listing_and_redrive() {
        let (operator, queue, _store) = operator();
        let job = operator.submit(request(1.0)).await.unwrap();

        let leased = queue.claim_next("worker-a").await.unwrap().unwrap();
        let settlement = queue
            .complete(
                leased,
                Completion::Failed {
                    reason: FailureReason::PolicyViolation {
                        message: "memory".to_string(),
                    },
                    result: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(settlement, Settlement::DeadLettered);

        let listed = operator.dead_letters(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, job.id);
        assert_eq!(listed[0].reason, "policy violation: memory");

        let redriven = operator.redrive(job.id).await.unwrap();
        assert_eq!(redriven.status, JobStatus::Pending);
        assert_eq!(redriven.attempts, 0);
        assert!(operator.dead_letters(10).await.unwrap().is_empty());
    }
}
