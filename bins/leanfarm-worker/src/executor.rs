/// Sandbox Executor
///
/// Runs one payload per call through `Preparing -> Running -> {Completed | TimedOut | Killed}`.
///
/// ## Guarantees
/// - The watchdog fires at the job's wall-clock limit and kills the whole tree
/// - Lease loss and shutdown take the same forced-termination path, and a
///   kill requested while preparing means nothing is launched
/// - Scratch usage is sampled while the payload runs; going over the quota
///   kills the tree
/// - Scratch storage is removed on every terminal transition, including
///   failures while preparing
/// - Captured output never exceeds the configured byte ceiling per stream
use leanfarm_common::policy::SandboxSpec;
use leanfarm_common::ExecutionResult;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::{SandboxBackend, SandboxError, SandboxHandle};
use crate::scratch::{CollectedOutputs, ScratchDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preparing,
    Running,
    Completed,
    TimedOut,
    Killed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Preparing => "preparing",
            Phase::Running => "running",
            Phase::Completed => "completed",
            Phase::TimedOut => "timed_out",
            Phase::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Why an execution was cancelled from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    LeaseLost,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited { exit_code: i64 },
    TimedOut,
    Killed(KillReason),
    /// Scratch usage went over the quota while running
    QuotaExceeded { used_bytes: u64 },
    /// The backend lost track of the payload; it was killed to be safe
    Crashed(String),
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub phase: Phase,
    pub termination: Termination,
    pub result: ExecutionResult,
    pub outputs: CollectedOutputs,
    /// The process tree was confirmed dead
    pub reaped: bool,
    pub scratch_removed: bool,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to prepare scratch storage: {0}")]
    Scratch(#[from] std::io::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

enum Stop {
    Exited(Result<i64, SandboxError>),
    Deadline,
    Cancel(KillReason),
    Quota(u64),
}

const QUOTA_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

pub struct SandboxExecutor<B: SandboxBackend> {
    backend: B,
    scratch_root: PathBuf,
    capture_bytes: usize,
    grace: Duration,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Counts a live sandbox for as long as it exists
struct ActiveSlot<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<B: SandboxBackend> SandboxExecutor<B> {
    pub fn new(backend: B, scratch_root: PathBuf, capture_bytes: usize, grace: Duration) -> Self {
        Self {
            backend,
            scratch_root,
            capture_bytes,
            grace,
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Sandboxes currently launched and not yet released
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn occupy(&self) -> ActiveSlot<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        ActiveSlot { active: &self.active }
    }

    pub async fn execute(
        &self,
        spec: &SandboxSpec,
        command: &[String],
        bundle: &[u8],
        cancel: &mut watch::Receiver<Option<KillReason>>,
    ) -> Result<ExecutionReport, ExecutorError> {
        let job_id = spec.job_id;
        debug!(job_id = %job_id, phase = %Phase::Preparing, "Preparing sandbox");

        let mut scratch = ScratchDir::create(&self.scratch_root, job_id, (spec.uid, spec.gid)).await?;
        debug!(job_id = %job_id, scratch = %scratch.path().display(), "Scratch ready");
        let limits = match self.prepare(&scratch, spec, bundle).await {
            Ok(limits) => limits,
            Err(e) => {
                scratch.cleanup().await;
                return Err(e);
            }
        };
        let pending_kill = *cancel.borrow_and_update();
        if let Some(reason) = pending_kill {
            info!(job_id = %job_id, reason = ?reason, "Kill requested before launch");
            let scratch_removed = scratch.cleanup().await;
            return Ok(ExecutionReport {
                phase: Phase::Killed,
                termination: Termination::Killed(reason),
                result: ExecutionResult::default(),
                outputs: CollectedOutputs::default(),
                reaped: true,
                scratch_removed,
            });
        }
        let mut handle = match self
            .backend
            .launch(&limits, spec, scratch.layout(), command, self.capture_bytes)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                scratch.cleanup().await;
                return Err(e.into());
            }
        };

        let _slot = self.occupy();
        let started = Instant::now();
        info!(
            job_id = %job_id,
            sandbox = handle.id(),
            phase = %Phase::Running,
            backend = self.backend.name(),
            timeout_secs = spec.timeout.as_secs_f64(),
            "Sandbox running"
        );

        let stop = tokio::select! {
            status = handle.wait() => Stop::Exited(status),
            _ = tokio::time::sleep(spec.timeout) => Stop::Deadline,
            reason = kill_requested(cancel) => Stop::Cancel(reason),
            used = quota_breached(&scratch, spec.scratch_quota_bytes) => Stop::Quota(used),
        };

        let (phase, termination, reaped) = match stop {
            Stop::Exited(Ok(exit_code)) => (Phase::Completed, Termination::Exited { exit_code }, true),
            Stop::Exited(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Lost track of sandbox, killing it");
                let reaped = self.force_stop(&mut handle).await;
                (Phase::Killed, Termination::Crashed(e.to_string()), reaped)
            }
            Stop::Deadline => {
                info!(job_id = %job_id, "Watchdog fired, terminating sandbox");
                let reaped = self.force_stop(&mut handle).await;
                (Phase::TimedOut, Termination::TimedOut, reaped)
            }
            Stop::Cancel(reason) => {
                info!(job_id = %job_id, reason = ?reason, "Cancelling sandbox");
                let reaped = self.force_stop(&mut handle).await;
                (Phase::Killed, Termination::Killed(reason), reaped)
            }
            Stop::Quota(used_bytes) => {
                info!(
                    job_id = %job_id,
                    used_bytes,
                    quota_bytes = spec.scratch_quota_bytes,
                    "Scratch quota exceeded, terminating sandbox"
                );
                let reaped = self.force_stop(&mut handle).await;
                (Phase::Killed, Termination::QuotaExceeded { used_bytes }, reaped)
            }
        };

        let output = handle.output().await;
        let peak_memory_bytes = handle.peak_memory_bytes();
        handle.release().await;
        let duration = started.elapsed();

        let outputs = if phase == Phase::Completed {
            // A fast payload can write and exit between two samples
            let used = scratch.usage().await;
            if used > spec.scratch_quota_bytes {
                CollectedOutputs {
                    files: Vec::new(),
                    total_bytes: used,
                    quota_exceeded: true,
                }
            } else {
                match scratch.collect_outputs(spec.scratch_quota_bytes).await {
                    Ok(outputs) => outputs,
                    Err(e) => {
                        scratch.cleanup().await;
                        return Err(ExecutorError::Scratch(e));
                    }
                }
            }
        } else {
            CollectedOutputs::default()
        };
        let scratch_removed = scratch.cleanup().await;

        let exit_code = match termination {
            Termination::Exited { exit_code } => Some(exit_code),
            _ => None,
        };
        debug!(
            job_id = %job_id,
            phase = %phase,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "Sandbox finished"
        );

        Ok(ExecutionReport {
            phase,
            termination,
            result: ExecutionResult {
                exit_code,
                stdout: output.stdout.text,
                stderr: output.stderr.text,
                stdout_truncated: output.stdout.truncated,
                stderr_truncated: output.stderr.truncated,
                duration_ms: duration.as_millis() as u64,
                peak_memory_bytes,
                artifacts: Vec::new(),
            },
            outputs,
            reaped,
            scratch_removed,
        })
    }

    async fn prepare(&self, scratch: &ScratchDir, spec: &SandboxSpec, bundle: &[u8]) -> Result<B::Limits, ExecutorError> {
        scratch.write_bundle(bundle).await?;
        Ok(self.backend.apply_limits(spec)?)
    }

    /// Kill the tree and wait out the grace period; false if it may have leaked
    async fn force_stop(&self, handle: &mut B::Handle) -> bool {
        if let Err(e) = handle.terminate_tree().await {
            warn!(sandbox = handle.id(), error = %e, "Terminate failed");
        }
        match tokio::time::timeout(self.grace, handle.wait()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                error!(sandbox = handle.id(), error = %e, "Could not confirm sandbox exit");
                false
            }
            Err(_) => {
                error!(
                    sandbox = handle.id(),
                    grace_secs = self.grace.as_secs_f64(),
                    "Sandbox not reaped within grace period"
                );
                false
            }
        }
    }
}

/// Resolves once a reason is published; never if the sender goes away
async fn kill_requested(cancel: &mut watch::Receiver<Option<KillReason>>) -> KillReason {
    loop {
        if let Some(reason) = *cancel.borrow_and_update() {
            return reason;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves with the usage once the scratch tree grows past `quota_bytes`
async fn quota_breached(scratch: &ScratchDir, quota_bytes: u64) -> u64 {
    let mut ticker = tokio::time::interval(QUOTA_SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let used = scratch.usage().await;
        if used > quota_bytes {
            return used;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use crate::test_support::{local_spec, scratch_base, MIB};
    use leanfarm_common::policy::IsolationMode;

    fn executor(base: &std::path::Path) -> SandboxExecutor<ProcessEngine> {
        SandboxExecutor::new(
            ProcessEngine::new(),
            base.to_path_buf(),
            4096,
            Duration::from_secs(2),
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn is_empty(dir: &std::path::Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_completed_run_collects_outputs() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (_tx, mut rx) = watch::channel(None);
        let script = "cat \"$LEANFARM_BUNDLE\" > \"$LEANFARM_OUTPUT/proof.olean\"; echo done";

        let report = executor
            .execute(&local_spec(Duration::from_secs(10)), &sh(script), b"theorem", &mut rx)
            .await
            .unwrap();

        assert_eq!(report.phase, Phase::Completed);
        assert_eq!(report.termination, Termination::Exited { exit_code: 0 });
        assert_eq!(report.result.stdout, "done\n");
        assert_eq!(report.outputs.files, vec![("proof.olean".to_string(), b"theorem".to_vec())]);
        assert!(report.scratch_removed);
        assert!(is_empty(base.path()));
        assert_eq!(executor.active(), 0);
    }

    #[tokio::test]
    async fn test_watchdog_kills_within_grace() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (_tx, mut rx) = watch::channel(None);

        let started = Instant::now();
        let report = executor
            .execute(&local_spec(Duration::from_millis(300)), &sh("sleep 30"), b"", &mut rx)
            .await
            .unwrap();

        assert_eq!(report.phase, Phase::TimedOut);
        assert_eq!(report.termination, Termination::TimedOut);
        assert!(report.reaped);
        assert_eq!(report.result.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.outputs.files.is_empty());
        assert!(is_empty(base.path()));
    }

    #[tokio::test]
    async fn test_cancel_takes_kill_path() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (tx, mut rx) = watch::channel(None);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(Some(KillReason::LeaseLost));
        });

        let report = executor
            .execute(&local_spec(Duration::from_secs(30)), &sh("sleep 30"), b"", &mut rx)
            .await
            .unwrap();

        assert_eq!(report.phase, Phase::Killed);
        assert_eq!(report.termination, Termination::Killed(KillReason::LeaseLost));
        assert!(report.scratch_removed);
        assert!(is_empty(base.path()));
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (_tx, mut rx) = watch::channel(None);

        let report = executor
            .execute(&local_spec(Duration::from_secs(10)), &sh("echo broken >&2; exit 7"), b"", &mut rx)
            .await
            .unwrap();
        assert_eq!(report.termination, Termination::Exited { exit_code: 7 });
        assert_eq!(report.result.stderr, "broken\n");
    }

    #[tokio::test]
    async fn test_preparing_failure_cleans_scratch() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (_tx, mut rx) = watch::channel(None);
        let mut spec = local_spec(Duration::from_secs(10));
        spec.isolation = IsolationMode::Gvisor;

        let err = executor
            .execute(&spec, &sh("true"), b"", &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Sandbox(SandboxError::Unsupported { .. })));
        assert!(is_empty(base.path()));
        assert_eq!(executor.peak_active(), 0);
    }

    #[tokio::test]
    async fn test_kill_before_launch_runs_nothing() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (_tx, mut rx) = watch::channel(Some(KillReason::Shutdown));

        let report = executor
            .execute(&local_spec(Duration::from_secs(10)), &sh("sleep 30"), b"", &mut rx)
            .await
            .unwrap();

        assert_eq!(report.phase, Phase::Killed);
        assert_eq!(report.termination, Termination::Killed(KillReason::Shutdown));
        assert_eq!(executor.peak_active(), 0);
        assert!(report.scratch_removed);
        assert!(is_empty(base.path()));
    }

    #[tokio::test]
    async fn test_writes_into_work_count_against_quota() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (_tx, mut rx) = watch::channel(None);
        let mut spec = local_spec(Duration::from_secs(10));
        spec.scratch_quota_bytes = 4 * MIB;
        let script = "for i in 1 2 3; do head -c 2097152 /dev/zero > \"$LEANFARM_WORKDIR/blob$i\"; done; \
                      echo small > \"$LEANFARM_OUTPUT/result.txt\"";

        let report = executor.execute(&spec, &sh(script), b"", &mut rx).await.unwrap();

        // Either the final check or the running sample catches it
        match report.termination {
            Termination::Exited { exit_code: 0 } => {
                assert!(report.outputs.quota_exceeded);
                assert!(report.outputs.total_bytes > spec.scratch_quota_bytes);
            }
            Termination::QuotaExceeded { used_bytes } => assert!(used_bytes > spec.scratch_quota_bytes),
            ref other => panic!("unexpected termination {:?}", other),
        }
        assert!(report.outputs.files.is_empty());
        assert!(is_empty(base.path()));
    }

    #[tokio::test]
    async fn test_quota_watch_kills_running_payload() {
        let base = scratch_base();
        let executor = executor(base.path());
        let (_tx, mut rx) = watch::channel(None);
        let mut spec = local_spec(Duration::from_secs(30));
        spec.scratch_quota_bytes = 4 * MIB;
        let script = "for i in 1 2 3; do head -c 2097152 /dev/zero > \"blob$i\"; done; sleep 30";

        let started = Instant::now();
        let report = executor.execute(&spec, &sh(script), b"", &mut rx).await.unwrap();

        assert_eq!(report.phase, Phase::Killed);
        assert!(matches!(
            report.termination,
            Termination::QuotaExceeded { used_bytes } if used_bytes > 4 * MIB
        ));
        assert!(report.reaped);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(is_empty(base.path()));
    }
}
