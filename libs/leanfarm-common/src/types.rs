use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::ArtifactKey;

/// Declared resource requirements of a job
/// Validated against the administrative ceilings, never clamped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Job State Machine
/// Explicitly models lifecycle states
///
/// ## Allowed transitions:
/// - `Pending -> Leased`
/// - `Leased -> Running | Pending | DeadLettered`
/// - `Running -> Succeeded | Failed | Pending`
/// - `Failed -> Pending | DeadLettered`
///
/// `DeadLettered -> Pending` only happens through an operator redrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Leased,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Leased)
                | (Leased, Running)
                | (Leased, Pending)
                | (Leased, DeadLettered)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Pending)
                | (Failed, Pending)
                | (Failed, DeadLettered)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLettered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("job {job_id}: illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Why an attempt did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureReason {
    PolicyViolation {
        message: String,
    },
    SandboxFailure {
        exit_code: Option<i64>,
        message: String,
    },
    TimedOut {
        timeout_seconds: u64,
    },
    Storage {
        message: String,
    },
    ScratchQuotaExceeded {
        used_bytes: u64,
        quota_bytes: u64,
    },
    /// Claimants kept disappearing without settling
    LeaseExpired {
        expirations: u32,
    },
}

impl FailureReason {
    /// Policy violations are deterministic and never retried; a job whose
    /// leases keep expiring has already used up its retries
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureReason::PolicyViolation { .. } | FailureReason::LeaseExpired { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::PolicyViolation { .. } => "policy_violation",
            FailureReason::SandboxFailure { .. } => "sandbox_failure",
            FailureReason::TimedOut { .. } => "timed_out",
            FailureReason::Storage { .. } => "storage",
            FailureReason::ScratchQuotaExceeded { .. } => "scratch_quota_exceeded",
            FailureReason::LeaseExpired { .. } => "lease_expired",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PolicyViolation { message } => write!(f, "policy violation: {}", message),
            FailureReason::SandboxFailure {
                exit_code: Some(code),
                message,
            } => write!(f, "sandbox exited with code {}: {}", code, message),
            FailureReason::SandboxFailure { exit_code: None, message } => {
                write!(f, "sandbox failure: {}", message)
            }
            FailureReason::TimedOut { timeout_seconds } => {
                write!(f, "timed out after {}s", timeout_seconds)
            }
            FailureReason::Storage { message } => write!(f, "storage error: {}", message),
            FailureReason::ScratchQuotaExceeded {
                used_bytes,
                quota_bytes,
            } => write!(
                f,
                "scratch quota exceeded: {} bytes used, {} allowed",
                used_bytes, quota_bytes
            ),
            FailureReason::LeaseExpired { expirations } => {
                write!(f, "lease expired {} times without a result", expirations)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { reason: FailureReason },
}

/// One settled attempt, appended to the job history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Outcome of one sandbox execution
/// Output streams are already truncated at the capture ceiling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactKey>,
}

/// Job record as stored in the queue
///
/// ## Ownership:
/// - Input fields (`bundle`, `command`, `resources`) are write-once
/// - Lifecycle fields are mutated only by the queue client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub bundle: ArtifactKey,
    pub command: Vec<String>,
    pub resources: ResourceRequest,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    /// Claims that ended in lease expiry rather than a settlement
    #[serde(default)]
    pub expired_leases: u32,
    #[serde(default)]
    pub artifacts: Vec<ArtifactKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(bundle: ArtifactKey, command: Vec<String>, resources: ResourceRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            bundle,
            command,
            resources,
            status: JobStatus::Pending,
            attempts: 0,
            history: Vec::new(),
            expired_leases: 0,
            artifacts: Vec::new(),
            last_result: None,
            last_failure: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move along one edge of the state machine
    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Operator redrive: back to Pending with a fresh attempt budget
    /// History is kept so the earlier failures stay visible
    pub fn redrive(&mut self) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::DeadLettered {
            return Err(InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.expired_leases = 0;
        self.worker_id = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// A lease that expired leaves the record in Leased or Running
    ///
    /// Returns true when a stale claim was undone; that claim is counted in
    /// `expired_leases`.
    pub fn reset_stale_claim(&mut self) -> Result<bool, InvalidTransition> {
        match self.status {
            JobStatus::Leased | JobStatus::Running => {
                self.transition(JobStatus::Pending)?;
                self.expired_leases += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Time-bounded exclusive claim on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub job_id: Uuid,
    pub token: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(job_id: Uuid, worker_id: &str, ttl: std::time::Duration, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            token: Uuid::new_v4().to_string(),
            worker_id: worker_id.to_string(),
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A claimed job together with the lease that guards it
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub lease: Lease,
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
