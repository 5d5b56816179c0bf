use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{geteuid, sysconf, Pid, SysconfVar};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    require_isolation, BoundedBuffer, CapturedOutput, CapturedStream, SandboxBackend, SandboxError,
    SandboxHandle, SandboxLayout,
};
use leanfarm_common::policy::{IsolationMode, SandboxSpec, SecurityProfile};

const BACKEND: &str = "process";
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// A descendant that escaped the group can hold a pipe open forever
const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Plain process isolation for the `local` profile
///
/// **Enforced:** own process group, non-root identity (when the worker is root),
/// rlimits for address space, processes, open files and file size, cleared
/// environment.
/// **Not enforced:** network namespace, syscall filter, read-only root.
pub struct ProcessEngine {
    sample_interval: Duration,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
        }
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessLimits {
    identity: Option<(u32, u32)>,
    address_space: u64,
    /// RLIMIT_NPROC counts every process of the real uid, so it is only
    /// meaningful once the payload has an identity of its own
    processes: Option<u64>,
    open_files: u64,
    file_size: u64,
    /// RLIMIT_CPU; the closest this backend gets to a core limit
    cpu_seconds: u64,
}

#[async_trait]
impl SandboxBackend for ProcessEngine {
    type Limits = ProcessLimits;
    type Handle = ProcessHandle;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn verify_profile(&self, profile: SecurityProfile) -> Result<(), SandboxError> {
        require_isolation(BACKEND, &[IsolationMode::Process], profile.isolation())?;
        warn!(
            backend = BACKEND,
            "CPU cores are not throttled by this backend; only a per-process CPU time budget applies"
        );
        Ok(())
    }

    fn apply_limits(&self, spec: &SandboxSpec) -> Result<ProcessLimits, SandboxError> {
        require_isolation(BACKEND, &[IsolationMode::Process], spec.isolation)?;
        if spec.uid == 0 || spec.gid == 0 {
            return Err(SandboxError::Unsupported {
                backend: BACKEND,
                what: "a root sandbox identity".to_string(),
            });
        }

        let identity = geteuid().is_root().then_some((spec.uid, spec.gid));
        Ok(ProcessLimits {
            identity,
            address_space: spec.memory_bytes,
            processes: identity.map(|_| u64::from(spec.max_processes)),
            open_files: u64::from(spec.max_open_files),
            file_size: spec.scratch_quota_bytes,
            cpu_seconds: cpu_budget(spec),
        })
    }

    async fn launch(
        &self,
        limits: &ProcessLimits,
        _spec: &SandboxSpec,
        layout: &SandboxLayout,
        command: &[String],
        capture_bytes: usize,
    ) -> Result<ProcessHandle, SandboxError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SandboxError::Launch("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&layout.work_dir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &layout.work_dir)
            .env("LEANFARM_BUNDLE", &layout.bundle_file)
            .env("LEANFARM_WORKDIR", &layout.work_dir)
            .env("LEANFARM_OUTPUT", &layout.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some((uid, gid)) = limits.identity {
            cmd.uid(uid).gid(gid);
        }
        let rlimits = limits.clone();
        // SAFETY: runs between fork and exec; only getrlimit/setrlimit syscalls, no allocation
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&rlimits));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Launch(format!("{}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Launch("payload exited before it was tracked".to_string()))?;
        let pgid = Pid::from_raw(pid as i32);

        let peak = Arc::new(AtomicU64::new(0));
        let handle = ProcessHandle {
            id: pid.to_string(),
            stdout: Some(capture(child.stdout.take(), capture_bytes)),
            stderr: Some(capture(child.stderr.take(), capture_bytes)),
            sampler: tokio::spawn(sample_peak(pgid.as_raw(), peak.clone(), self.sample_interval)),
            child,
            pgid,
            exit_code: None,
            peak,
        };
        debug!(pid, program = %program, "Launched sandboxed process");
        Ok(handle)
    }
}

pub struct ProcessHandle {
    id: String,
    child: Child,
    pgid: Pid,
    exit_code: Option<i64>,
    stdout: Option<JoinHandle<CapturedStream>>,
    stderr: Option<JoinHandle<CapturedStream>>,
    sampler: JoinHandle<()>,
    peak: Arc<AtomicU64>,
}

impl ProcessHandle {
    fn kill_group(&self) -> Result<(), SandboxError> {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SandboxError::Terminate(format!(
                "killpg({}): {}",
                self.pgid, e
            ))),
        }
    }
}

#[async_trait]
impl SandboxHandle for ProcessHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> Result<i64, SandboxError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SandboxError::Wait(e.to_string()))?;
        let code = status
            .code()
            .map(i64::from)
            .unwrap_or_else(|| 128 + i64::from(status.signal().unwrap_or(0)));
        self.exit_code = Some(code);

        // Background descendants never outlive the payload
        if let Err(e) = self.kill_group() {
            warn!(error = %e, "Failed to reap process group after exit");
        }
        Ok(code)
    }

    async fn terminate_tree(&mut self) -> Result<(), SandboxError> {
        self.kill_group()?;
        if self.exit_code.is_none() {
            // The leader may have left the group; it is still our child
            let _ = self.child.start_kill();
        }
        Ok(())
    }

    async fn output(&mut self) -> CapturedOutput {
        CapturedOutput {
            stdout: join_capture(self.stdout.take()).await,
            stderr: join_capture(self.stderr.take()).await,
        }
    }

    fn peak_memory_bytes(&self) -> Option<u64> {
        match self.peak.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }

    async fn release(&mut self) {
        self.sampler.abort();
        if let Err(e) = self.kill_group() {
            warn!(error = %e, "Failed to kill process group on release");
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.sampler.abort();
        let _ = killpg(self.pgid, Signal::SIGKILL);
    }
}

fn apply_rlimits(limits: &ProcessLimits) -> std::io::Result<()> {
    lower(Resource::RLIMIT_AS, limits.address_space)?;
    lower(Resource::RLIMIT_NOFILE, limits.open_files)?;
    lower(Resource::RLIMIT_FSIZE, limits.file_size)?;
    lower(Resource::RLIMIT_CORE, 0)?;
    lower(Resource::RLIMIT_CPU, limits.cpu_seconds)?;
    if let Some(processes) = limits.processes {
        lower(Resource::RLIMIT_NPROC, processes)?;
    }
    Ok(())
}

/// CPU seconds a process could burn running `cpu_cores` flat out until the deadline
fn cpu_budget(spec: &SandboxSpec) -> u64 {
    (spec.cpu_cores * spec.timeout.as_secs_f64()).ceil().max(1.0) as u64
}

/// Set soft and hard limit, never above the inherited hard limit
fn lower(resource: Resource, value: u64) -> std::io::Result<()> {
    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)?;
    Ok(())
}

fn capture<R>(reader: Option<R>, limit: usize) -> JoinHandle<CapturedStream>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = BoundedBuffer::new(limit);
        if let Some(mut reader) = reader {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buffer.push(&chunk[..n]),
                }
            }
        }
        buffer.finish()
    })
}

async fn join_capture(task: Option<JoinHandle<CapturedStream>>) -> CapturedStream {
    let Some(mut task) = task else {
        return CapturedStream::default();
    };
    match tokio::time::timeout(CAPTURE_JOIN_TIMEOUT, &mut task).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) => CapturedStream::default(),
        Err(_) => {
            task.abort();
            CapturedStream {
                text: String::new(),
                truncated: true,
            }
        }
    }
}

async fn sample_peak(pgid: i32, peak: Arc<AtomicU64>, every: Duration) {
    let page_size = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(4096);
    loop {
        let pages = tokio::task::spawn_blocking(move || group_rss_pages(pgid))
            .await
            .unwrap_or(0);
        peak.fetch_max(pages * page_size, Ordering::Relaxed);
        tokio::time::sleep(every).await;
    }
}

fn group_rss_pages(pgid: i32) -> u64 {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .filter(|(group, _)| *group == pgid)
        .map(|(_, rss)| rss)
        .sum()
}

/// (pgrp, rss pages) from a `/proc/<pid>/stat` line
fn parse_stat(stat: &str) -> Option<(i32, u64)> {
    // comm may contain spaces and parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss))
}
