use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    require_isolation, BoundedBuffer, CapturedOutput, CapturedStream, SandboxBackend, SandboxError,
    SandboxHandle, SandboxLayout,
};
use leanfarm_common::config::NetworkPolicy;
use leanfarm_common::policy::{IsolationMode, SandboxSpec, SecurityProfile};

const BACKEND: &str = "docker";
const SUPPORTED: &[IsolationMode] = &[IsolationMode::Gvisor, IsolationMode::Container];
const GVISOR_RUNTIME: &str = "runsc";
const LOG_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// In-container mount points
const BUNDLE_PATH: &str = "/bundle/bundle";
const WORK_PATH: &str = "/work";
const OUTPUT_PATH: &str = "/output";

/// Container backend for the `hardened` (gVisor) and `container` profiles
pub struct DockerEngine {
    docker: Docker,
    image: String,
}

/// Everything a spec turns into on the Docker side
#[derive(Debug, Clone)]
pub struct ContainerLimits {
    host_config: HostConfig,
    user: String,
    network_disabled: bool,
}

impl DockerEngine {
    pub async fn connect(image: impl Into<String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Launch(format!("cannot reach Docker daemon: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Launch(format!("Docker daemon did not answer ping: {}", e)))?;

        let engine = Self {
            docker,
            image: image.into(),
        };
        engine.ensure_image().await?;
        info!(image = %engine.image, "Docker sandbox backend ready");
        Ok(engine)
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.image, "Pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::Launch(format!("failed to pull {}: {}", self.image, e)))?;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            warn!(container = id, error = %e, "Failed to remove container");
        }
    }
}

fn unsupported(what: impl Into<String>) -> SandboxError {
    SandboxError::Unsupported {
        backend: BACKEND,
        what: what.into(),
    }
}

/// The daemon must have `name` registered, or every container asking for it fails
fn require_runtime<V>(runtimes: Option<&HashMap<String, V>>, name: &str) -> Result<(), SandboxError> {
    if runtimes.is_some_and(|runtimes| runtimes.contains_key(name)) {
        Ok(())
    } else {
        Err(unsupported(format!("{} runtime", name)))
    }
}

/// Translate a spec into container settings; any value Docker cannot
/// represent is an error, never a silent clamp
fn container_limits(spec: &SandboxSpec) -> Result<ContainerLimits, SandboxError> {
    require_isolation(BACKEND, SUPPORTED, spec.isolation)?;
    if spec.uid == 0 || spec.gid == 0 {
        return Err(unsupported("a root sandbox identity"));
    }
    if !spec.capabilities.is_empty() {
        return Err(unsupported(format!("added capabilities {:?}", spec.capabilities)));
    }

    let memory = i64::try_from(spec.memory_bytes)
        .map_err(|_| unsupported(format!("{} bytes of memory", spec.memory_bytes)))?;
    let nano_cpus = spec.cpu_cores * 1e9;
    if !nano_cpus.is_finite() || nano_cpus < 1.0 || nano_cpus > i64::MAX as f64 {
        return Err(unsupported(format!("{} CPU cores", spec.cpu_cores)));
    }
    let open_files = i64::from(spec.max_open_files);

    let mut security_opt = Vec::new();
    if spec.no_new_privileges {
        security_opt.push("no-new-privileges:true".to_string());
    }
    let network_mode = match spec.network {
        NetworkPolicy::DenyAll => "none",
    };
    let tmpfs = HashMap::from([(
        "/tmp".to_string(),
        format!("rw,noexec,nosuid,size={}", spec.scratch_quota_bytes),
    )]);

    let host_config = HostConfig {
        memory: Some(memory),
        memory_swap: Some(memory),
        nano_cpus: Some(nano_cpus.round() as i64),
        pids_limit: Some(i64::from(spec.max_processes)),
        ulimits: Some(vec![ResourcesUlimits {
            name: Some("nofile".to_string()),
            soft: Some(open_files),
            hard: Some(open_files),
        }]),
        cap_drop: Some(spec.drop_capabilities.clone()),
        cap_add: Some(Vec::new()),
        readonly_rootfs: Some(spec.read_only_root),
        security_opt: Some(security_opt),
        network_mode: Some(network_mode.to_string()),
        runtime: (spec.isolation == IsolationMode::Gvisor).then(|| GVISOR_RUNTIME.to_string()),
        tmpfs: Some(tmpfs),
        privileged: Some(false),
        ..Default::default()
    };

    Ok(ContainerLimits {
        host_config,
        user: format!("{}:{}", spec.uid, spec.gid),
        network_disabled: true,
    })
}

#[async_trait]
impl SandboxBackend for DockerEngine {
    type Limits = ContainerLimits;
    type Handle = DockerHandle;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn verify_profile(&self, profile: SecurityProfile) -> Result<(), SandboxError> {
        require_isolation(BACKEND, SUPPORTED, profile.isolation())?;
        if profile.isolation() == IsolationMode::Gvisor {
            let info = self
                .docker
                .info()
                .await
                .map_err(|e| SandboxError::Launch(format!("cannot query Docker daemon info: {}", e)))?;
            require_runtime(info.runtimes.as_ref(), GVISOR_RUNTIME)?;
        }
        Ok(())
    }

    fn apply_limits(&self, spec: &SandboxSpec) -> Result<ContainerLimits, SandboxError> {
        container_limits(spec)
    }

    async fn launch(
        &self,
        limits: &ContainerLimits,
        spec: &SandboxSpec,
        layout: &SandboxLayout,
        command: &[String],
        capture_bytes: usize,
    ) -> Result<DockerHandle, SandboxError> {
        if command.is_empty() {
            return Err(SandboxError::Launch("empty command".to_string()));
        }

        let mut host_config = limits.host_config.clone();
        host_config.binds = Some(vec![
            format!("{}:{}:ro", layout.bundle_file.display(), BUNDLE_PATH),
            format!("{}:{}:rw", layout.work_dir.display(), WORK_PATH),
            format!("{}:{}:rw", layout.output_dir.display(), OUTPUT_PATH),
        ]);

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(command.to_vec()),
            env: Some(vec![
                format!("LEANFARM_BUNDLE={}", BUNDLE_PATH),
                format!("LEANFARM_WORKDIR={}", WORK_PATH),
                format!("LEANFARM_OUTPUT={}", OUTPUT_PATH),
                format!("HOME={}", WORK_PATH),
            ]),
            user: Some(limits.user.clone()),
            working_dir: Some(WORK_PATH.to_string()),
            labels: Some(HashMap::from([
                ("leanfarm.job-id".to_string(), spec.job_id.to_string()),
                ("leanfarm.profile".to_string(), spec.profile.to_string()),
            ])),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(limits.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("leanfarm-{}-{}", spec.job_id, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::Launch(format!("failed to create container: {}", e)))?;
        let id = container.id;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&id).await;
            return Err(SandboxError::Launch(format!("failed to start container: {}", e)));
        }
        debug!(container = %id, job_id = %spec.job_id, "Started sandbox container");

        let peak = Arc::new(AtomicU64::new(0));
        Ok(DockerHandle {
            logs: Some(tokio::spawn(collect_logs(self.docker.clone(), id.clone(), capture_bytes))),
            stats: tokio::spawn(sample_peak(self.docker.clone(), id.clone(), peak.clone())),
            docker: self.docker.clone(),
            id,
            exit_code: None,
            peak,
            released: false,
        })
    }
}

pub struct DockerHandle {
    docker: Docker,
    id: String,
    exit_code: Option<i64>,
    logs: Option<JoinHandle<CapturedOutput>>,
    stats: JoinHandle<()>,
    peak: Arc<AtomicU64>,
    released: bool,
}

#[async_trait]
impl SandboxHandle for DockerHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> Result<i64, SandboxError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&self.id, Some(options));
        let code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // Non-zero exits arrive as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(SandboxError::Wait(e.to_string())),
            None => return Err(SandboxError::Wait("wait stream ended without a status".to_string())),
        };
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn terminate_tree(&mut self) -> Result<(), SandboxError> {
        if self.exit_code.is_some() || self.released {
            return Ok(());
        }
        // Killing the container's init takes the whole PID namespace with it
        match self
            .docker
            .kill_container(&self.id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            // 404: already gone, 409: not running
            Err(DockerError::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 409 =>
            {
                Ok(())
            }
            Err(e) => Err(SandboxError::Terminate(e.to_string())),
        }
    }

    async fn output(&mut self) -> CapturedOutput {
        let Some(mut task) = self.logs.take() else {
            return CapturedOutput::default();
        };
        match tokio::time::timeout(LOG_JOIN_TIMEOUT, &mut task).await {
            Ok(Ok(output)) => output,
            Ok(Err(_)) => CapturedOutput::default(),
            Err(_) => {
                task.abort();
                warn!(container = %self.id, "Log stream did not finish, output marked truncated");
                let cut = CapturedStream {
                    text: String::new(),
                    truncated: true,
                };
                CapturedOutput {
                    stdout: cut.clone(),
                    stderr: cut,
                }
            }
        }
    }

    fn peak_memory_bytes(&self) -> Option<u64> {
        match self.peak.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.stats.abort();
        if let Some(logs) = self.logs.take() {
            logs.abort();
        }
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&self.id, Some(options)).await {
            Ok(()) => self.released = true,
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => self.released = true,
            Err(e) => warn!(container = %self.id, error = %e, "Failed to remove container"),
        }
    }
}

impl Drop for DockerHandle {
    fn drop(&mut self) {
        self.stats.abort();
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let docker = self.docker.clone();
        let id = std::mem::take(&mut self.id);
        runtime.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            let _ = docker.remove_container(&id, Some(options)).await;
        });
    }
}

async fn collect_logs(docker: Docker, id: String, limit: usize) -> CapturedOutput {
    let options = Some(LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        ..Default::default()
    });
    let mut stdout = BoundedBuffer::new(limit);
    let mut stderr = BoundedBuffer::new(limit);

    let mut stream = docker.logs(&id, options);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message }) => stdout.push(&message),
            Ok(LogOutput::StdErr { message }) => stderr.push(&message),
            Ok(_) => {}
            Err(e) => {
                debug!(container = %id, error = %e, "Log stream ended");
                break;
            }
        }
    }

    CapturedOutput {
        stdout: stdout.finish(),
        stderr: stderr.finish(),
    }
}

async fn sample_peak(docker: Docker, id: String, peak: Arc<AtomicU64>) {
    let options = Some(StatsOptions {
        stream: true,
        one_shot: false,
    });
    let mut stream = docker.stats(&id, options);
    while let Some(Ok(stats)) = stream.next().await {
        let memory = &stats.memory_stats;
        // cgroup v1 reports max_usage; on v2 the samples are all we get
        let observed = memory.max_usage.unwrap_or(0).max(memory.usage.unwrap_or(0));
        peak.fetch_max(observed, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::local_spec;

    fn hardened_spec() -> SandboxSpec {
        let mut spec = local_spec(Duration::from_secs(30));
        spec.profile = SecurityProfile::Hardened;
        spec.isolation = IsolationMode::Gvisor;
        spec
    }

    #[test]
    fn test_gvisor_runtime_must_be_registered() {
        let registered = HashMap::from([
            ("runc".to_string(), ()),
            (GVISOR_RUNTIME.to_string(), ()),
        ]);
        assert!(require_runtime(Some(&registered), GVISOR_RUNTIME).is_ok());

        let runc_only = HashMap::from([("runc".to_string(), ())]);
        assert!(matches!(
            require_runtime(Some(&runc_only), GVISOR_RUNTIME),
            Err(SandboxError::Unsupported { backend: "docker", ref what }) if what == "runsc runtime"
        ));
        assert!(require_runtime::<()>(None, GVISOR_RUNTIME).is_err());
    }

    #[test]
    fn test_hardened_spec_locks_container_down() {
        let spec = hardened_spec();
        let limits = container_limits(&spec).unwrap();
        let host = &limits.host_config;

        assert_eq!(limits.user, "1000:1000");
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.runtime.as_deref(), Some(GVISOR_RUNTIME));
        assert_eq!(host.memory, Some(spec.memory_bytes as i64));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.pids_limit, Some(i64::from(spec.max_processes)));
        assert!(host
            .security_opt
            .as_ref()
            .unwrap()
            .contains(&"no-new-privileges:true".to_string()));
        assert_eq!(host.privileged, Some(false));
    }

    #[test]
    fn test_container_profile_uses_default_runtime() {
        let mut spec = hardened_spec();
        spec.profile = SecurityProfile::Container;
        spec.isolation = IsolationMode::Container;
        let limits = container_limits(&spec).unwrap();
        assert_eq!(limits.host_config.runtime, None);
    }

    #[test]
    fn test_unrepresentable_values_fail_closed() {
        let mut spec = hardened_spec();
        spec.memory_bytes = u64::MAX;
        assert!(matches!(
            container_limits(&spec),
            Err(SandboxError::Unsupported { .. })
        ));

        let mut spec = hardened_spec();
        spec.capabilities = vec!["NET_ADMIN".to_string()];
        assert!(container_limits(&spec).is_err());

        let mut spec = hardened_spec();
        spec.uid = 0;
        assert!(container_limits(&spec).is_err());
    }

    #[test]
    fn test_process_isolation_rejected() {
        assert!(container_limits(&local_spec(Duration::from_secs(1))).is_err());
    }
}
