/// Sandbox Engine - capability interface over isolation backends
///
/// **Core Responsibility:**
/// Launch one payload under a `SandboxSpec` and kill its whole process tree on demand.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to isolate (container runtime, process group, rlimits)
/// - Engine does NOT know about leases, retries or artifacts
/// - Engine does NOT decide when to kill; the executor's watchdog does
///
/// **Implementations:**
/// - `DockerEngine` for the `hardened` and `container` profiles
/// - `ProcessEngine` for the `local` profile
use async_trait::async_trait;
use leanfarm_common::policy::{IsolationMode, SandboxSpec, SecurityProfile};
use std::path::PathBuf;
use thiserror::Error;

pub mod docker;
pub mod process;

pub use docker::DockerEngine;
pub use process::ProcessEngine;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{backend} backend cannot enforce {what}")]
    Unsupported { backend: &'static str, what: String },
    #[error("failed to launch sandbox: {0}")]
    Launch(String),
    #[error("failed to wait for sandbox: {0}")]
    Wait(String),
    #[error("failed to terminate sandbox: {0}")]
    Terminate(String),
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host paths prepared for one execution
#[derive(Debug, Clone)]
pub struct SandboxLayout {
    /// Code bundle, read-only to the payload
    pub bundle_file: PathBuf,
    /// Scratch working directory
    pub work_dir: PathBuf,
    /// Every regular file left here becomes an artifact
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
}

/// Keeps at most `limit` bytes; the rest is counted and dropped
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(8192)),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.dropped += (chunk.len() - take) as u64;
    }

    pub fn finish(self) -> CapturedStream {
        CapturedStream {
            text: String::from_utf8_lossy(&self.buf).into_owned(),
            truncated: self.dropped > 0,
        }
    }
}

/// Isolation backend
///
/// Any implementation must guarantee:
/// 1. The payload never runs with more privilege than its SandboxSpec allows
/// 2. `terminate_tree` reaches every descendant, including orphans
/// 3. Output capture stays bounded no matter how much the payload writes
#[async_trait]
pub trait SandboxBackend: Send + Sync + 'static {
    /// Backend parameters derived from a spec
    type Limits: Send + Sync;
    type Handle: SandboxHandle;

    fn name(&self) -> &'static str;

    /// Startup check that the configured profile is enforceable here
    async fn verify_profile(&self, profile: SecurityProfile) -> Result<(), SandboxError>;

    /// Translate a SandboxSpec, failing closed on anything the backend cannot enforce
    fn apply_limits(&self, spec: &SandboxSpec) -> Result<Self::Limits, SandboxError>;

    async fn launch(
        &self,
        limits: &Self::Limits,
        spec: &SandboxSpec,
        layout: &SandboxLayout,
        command: &[String],
        capture_bytes: usize,
    ) -> Result<Self::Handle, SandboxError>;
}

/// A running sandbox
#[async_trait]
pub trait SandboxHandle: Send + 'static {
    fn id(&self) -> &str;

    /// Exit code of the payload; cancel-safe so it can sit in a `select!`
    async fn wait(&mut self) -> Result<i64, SandboxError>;

    /// Force-kill the whole process tree; idempotent
    async fn terminate_tree(&mut self) -> Result<(), SandboxError>;

    /// Join the bounded output captures
    async fn output(&mut self) -> CapturedOutput;

    fn peak_memory_bytes(&self) -> Option<u64>;

    /// Reclaim backend resources (containers, mounts); idempotent
    async fn release(&mut self);
}

pub(crate) fn require_isolation(
    backend: &'static str,
    supported: &[IsolationMode],
    isolation: IsolationMode,
) -> Result<(), SandboxError> {
    if supported.contains(&isolation) {
        Ok(())
    } else {
        Err(SandboxError::Unsupported {
            backend,
            what: format!("{:?} isolation", isolation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_buffer_truncates() {
        let mut buffer = BoundedBuffer::new(8);
        buffer.push(b"hello ");
        buffer.push(b"world");
        buffer.push(b"!!!");
        let stream = buffer.finish();
        assert_eq!(stream.text, "hello wo");
        assert!(stream.truncated);
    }

    #[test]
    fn test_bounded_buffer_exact_fit() {
        let mut buffer = BoundedBuffer::new(5);
        buffer.push(b"hello");
        let stream = buffer.finish();
        assert_eq!(stream.text, "hello");
        assert!(!stream.truncated);
    }

    #[test]
    fn test_isolation_check() {
        assert!(require_isolation("process", &[IsolationMode::Process], IsolationMode::Process).is_ok());
        assert!(matches!(
            require_isolation("process", &[IsolationMode::Process], IsolationMode::Gvisor),
            Err(SandboxError::Unsupported { .. })
        ));
    }
}
