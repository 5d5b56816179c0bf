pub mod artifact;
pub mod backoff;
pub mod config;
pub mod policy;
pub mod queue;
pub mod redis;
pub mod types;

// Re-export commonly used types for convenience
pub use artifact::{ArtifactKey, ArtifactStore, StorageError};
pub use backoff::{Backoff, RetryPolicy};
pub use config::{Config, ConfigError};
pub use policy::{build_sandbox_spec, PolicyViolation, SandboxSpec, SecurityPolicy, SecurityProfile};
pub use queue::{Completion, JobQueue, QueueError, Settlement};
pub use types::{ExecutionResult, FailureReason, Job, JobStatus, Lease, LeasedJob, ResourceRequest};
