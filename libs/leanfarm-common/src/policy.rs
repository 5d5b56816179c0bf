//! Resource & Security Policy
//!
//! `build_sandbox_spec` is a pure function of the job and the static policy.
//! Requests above an administrative ceiling are rejected, never clamped, and
//! anything ambiguous (NaN cores, zero memory, empty command) is rejected too.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Config, ConfigError, NetworkPolicy};
use crate::types::Job;

/// Named security profiles, resolved once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    /// gVisor user-space kernel in front of the container
    Hardened,
    /// Default OCI runtime with the runtime's seccomp profile
    Container,
    /// Unprivileged process with rlimits; development hosts only
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    Gvisor,
    Container,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyscallFilter {
    RuntimeDefault,
    Unfiltered,
}

impl SecurityProfile {
    pub fn all_variants() -> &'static [SecurityProfile] {
        &[
            SecurityProfile::Hardened,
            SecurityProfile::Container,
            SecurityProfile::Local,
        ]
    }

    pub fn isolation(self) -> IsolationMode {
        match self {
            SecurityProfile::Hardened => IsolationMode::Gvisor,
            SecurityProfile::Container => IsolationMode::Container,
            SecurityProfile::Local => IsolationMode::Process,
        }
    }

    pub fn syscall_filter(self) -> SyscallFilter {
        match self {
            SecurityProfile::Hardened | SecurityProfile::Container => SyscallFilter::RuntimeDefault,
            SecurityProfile::Local => SyscallFilter::Unfiltered,
        }
    }

    /// Whether the profile can guarantee deny-all egress on its own
    pub fn isolates_network(self) -> bool {
        !matches!(self, SecurityProfile::Local)
    }
}

impl FromStr for SecurityProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hardened" => Ok(SecurityProfile::Hardened),
            "container" => Ok(SecurityProfile::Container),
            "local" => Ok(SecurityProfile::Local),
            other => Err(format!(
                "unknown security profile {:?} (expected hardened, container or local)",
                other
            )),
        }
    }
}

impl fmt::Display for SecurityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityProfile::Hardened => write!(f, "hardened"),
            SecurityProfile::Container => write!(f, "container"),
            SecurityProfile::Local => write!(f, "local"),
        }
    }
}

/// Static security baseline plus administrative ceilings
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityPolicy {
    pub profile: SecurityProfile,
    pub uid: u32,
    pub gid: u32,
    pub cpu_ceiling_cores: f64,
    pub memory_ceiling_bytes: u64,
    pub timeout_ceiling: Duration,
    pub process_ceiling: u32,
    pub open_files_ceiling: u32,
    pub scratch_quota_bytes: u64,
    pub network: NetworkPolicy,
}

impl SecurityPolicy {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let policy = Self {
            profile: config.security_profile,
            uid: config.sandbox_uid,
            gid: config.sandbox_gid,
            cpu_ceiling_cores: config.cpu_ceiling_cores,
            memory_ceiling_bytes: config.memory_ceiling_bytes,
            timeout_ceiling: Duration::from_secs(config.job_timeout_seconds),
            process_ceiling: config.process_ceiling,
            open_files_ceiling: config.open_files_ceiling,
            scratch_quota_bytes: config.scratch_dir_quota_bytes,
            network: config.network_policy,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |option: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                option,
                reason: reason.to_string(),
            })
        };
        if self.uid == 0 {
            return fail("sandboxUid", "sandboxes never run as root");
        }
        if self.gid == 0 {
            return fail("sandboxGid", "sandboxes never run with the root group");
        }
        if !self.cpu_ceiling_cores.is_finite() || self.cpu_ceiling_cores <= 0.0 {
            return fail("cpuCeilingCores", "must be a positive number");
        }
        if self.memory_ceiling_bytes == 0 {
            return fail("memoryCeilingBytes", "must be greater than zero");
        }
        if self.timeout_ceiling.is_zero() {
            return fail("jobTimeoutSeconds", "must be greater than zero");
        }
        if self.process_ceiling == 0 {
            return fail("processCeiling", "must be greater than zero");
        }
        if self.open_files_ceiling == 0 {
            return fail("openFilesCeiling", "must be greater than zero");
        }
        if self.scratch_quota_bytes == 0 {
            return fail("scratchDirQuotaBytes", "must be greater than zero");
        }
        Ok(())
    }
}

/// Immutable per-execution isolation description
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub job_id: Uuid,
    pub profile: SecurityProfile,
    pub isolation: IsolationMode,
    pub syscall_filter: SyscallFilter,
    /// Capabilities granted to the payload; always empty
    pub capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    pub no_new_privileges: bool,
    pub read_only_root: bool,
    pub scratch_quota_bytes: u64,
    pub uid: u32,
    pub gid: u32,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub max_processes: u32,
    pub max_open_files: u32,
    pub network: NetworkPolicy,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyViolation {
    #[error("requested {requested} CPU cores exceeds the ceiling of {ceiling}")]
    CpuExceeded { requested: f64, ceiling: f64 },
    #[error("requested {requested} bytes of memory exceeds the ceiling of {ceiling}")]
    MemoryExceeded { requested: u64, ceiling: u64 },
    #[error("requested timeout of {requested}s exceeds the ceiling of {ceiling}s")]
    TimeoutExceeded { requested: u64, ceiling: u64 },
    #[error("invalid resource request: {0}")]
    InvalidRequest(String),
    #[error("job has no command to run")]
    EmptyCommand,
}

/// Merge a job's resource request with the static policy
pub fn build_sandbox_spec(job: &Job, policy: &SecurityPolicy) -> Result<SandboxSpec, PolicyViolation> {
    let request = &job.resources;

    if job.command.first().map_or(true, |program| program.trim().is_empty()) {
        return Err(PolicyViolation::EmptyCommand);
    }
    if !request.cpu_cores.is_finite() || request.cpu_cores <= 0.0 {
        return Err(PolicyViolation::InvalidRequest(format!(
            "cpu cores must be a positive number, got {}",
            request.cpu_cores
        )));
    }
    if request.cpu_cores > policy.cpu_ceiling_cores {
        return Err(PolicyViolation::CpuExceeded {
            requested: request.cpu_cores,
            ceiling: policy.cpu_ceiling_cores,
        });
    }
    if request.memory_bytes == 0 {
        return Err(PolicyViolation::InvalidRequest(
            "memory must be greater than zero".to_string(),
        ));
    }
    if request.memory_bytes > policy.memory_ceiling_bytes {
        return Err(PolicyViolation::MemoryExceeded {
            requested: request.memory_bytes,
            ceiling: policy.memory_ceiling_bytes,
        });
    }
    let timeout = match request.timeout_seconds {
        Some(0) => {
            return Err(PolicyViolation::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            ))
        }
        Some(secs) if secs > policy.timeout_ceiling.as_secs() => {
            return Err(PolicyViolation::TimeoutExceeded {
                requested: secs,
                ceiling: policy.timeout_ceiling.as_secs(),
            })
        }
        Some(secs) => Duration::from_secs(secs),
        None => policy.timeout_ceiling,
    };

    Ok(SandboxSpec {
        job_id: job.id,
        profile: policy.profile,
        isolation: policy.profile.isolation(),
        syscall_filter: policy.profile.syscall_filter(),
        capabilities: Vec::new(),
        drop_capabilities: vec!["ALL".to_string()],
        no_new_privileges: true,
        read_only_root: true,
        scratch_quota_bytes: policy.scratch_quota_bytes,
        uid: policy.uid,
        gid: policy.gid,
        cpu_cores: request.cpu_cores,
        memory_bytes: request.memory_bytes,
        max_processes: policy.process_ceiling,
        max_open_files: policy.open_files_ceiling,
        network: policy.network,
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKey;
    use crate::types::ResourceRequest;

    const MIB: u64 = 1024 * 1024;

    fn policy() -> SecurityPolicy {
        SecurityPolicy {
            profile: SecurityProfile::Hardened,
            uid: 1000,
            gid: 1000,
            cpu_ceiling_cores: 8.0,
            memory_ceiling_bytes: 4096 * MIB,
            timeout_ceiling: Duration::from_secs(300),
            process_ceiling: 100,
            open_files_ceiling: 1024,
            scratch_quota_bytes: 1024 * MIB,
            network: NetworkPolicy::DenyAll,
        }
    }

    fn job(cpu_cores: f64, memory_bytes: u64, timeout_seconds: Option<u64>) -> Job {
        Job::new(
            ArtifactKey::for_content("leanfarm", b"bundle"),
            vec!["lake".into(), "build".into()],
            ResourceRequest {
                cpu_cores,
                memory_bytes,
                timeout_seconds,
            },
        )
    }

    #[test]
    fn test_within_ceilings_builds_locked_down_spec() {
        let spec = build_sandbox_spec(&job(1.0, 512 * MIB, Some(60)), &policy()).unwrap();
        assert_ne!(spec.uid, 0);
        assert!(spec.capabilities.is_empty());
        assert_eq!(spec.drop_capabilities, vec!["ALL".to_string()]);
        assert!(spec.read_only_root);
        assert!(spec.no_new_privileges);
        assert_eq!(spec.network, NetworkPolicy::DenyAll);
        assert_eq!(spec.isolation, IsolationMode::Gvisor);
        assert_eq!(spec.timeout, Duration::from_secs(60));
        assert_eq!(spec.memory_bytes, 512 * MIB);
    }

    #[test]
    fn test_cpu_above_ceiling_is_violation() {
        let err = build_sandbox_spec(&job(64.0, 512 * MIB, None), &policy()).unwrap_err();
        assert_eq!(
            err,
            PolicyViolation::CpuExceeded {
                requested: 64.0,
                ceiling: 8.0
            }
        );
    }

    #[test]
    fn test_memory_is_never_clamped() {
        let err = build_sandbox_spec(&job(1.0, 4096 * MIB + 1, None), &policy()).unwrap_err();
        assert!(matches!(err, PolicyViolation::MemoryExceeded { .. }));
    }

    #[test]
    fn test_timeout_defaults_to_ceiling() {
        let spec = build_sandbox_spec(&job(1.0, MIB, None), &policy()).unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(300));

        let err = build_sandbox_spec(&job(1.0, MIB, Some(301)), &policy()).unwrap_err();
        assert!(matches!(err, PolicyViolation::TimeoutExceeded { requested: 301, .. }));
    }

    #[test]
    fn test_ambiguous_requests_fail_closed() {
        for request in [
            job(f64::NAN, MIB, None),
            job(f64::INFINITY, MIB, None),
            job(0.0, MIB, None),
            job(-1.0, MIB, None),
            job(1.0, 0, None),
            job(1.0, MIB, Some(0)),
        ] {
            assert!(matches!(
                build_sandbox_spec(&request, &policy()),
                Err(PolicyViolation::InvalidRequest(_))
            ));
        }

        let mut empty = job(1.0, MIB, None);
        empty.command.clear();
        assert_eq!(
            build_sandbox_spec(&empty, &policy()).unwrap_err(),
            PolicyViolation::EmptyCommand
        );
    }

    #[test]
    fn test_deterministic() {
        let job = job(2.0, 256 * MIB, Some(30));
        assert_eq!(
            build_sandbox_spec(&job, &policy()).unwrap(),
            build_sandbox_spec(&job, &policy()).unwrap()
        );
    }

    #[test]
    fn test_profiles_resolve() {
        assert_eq!(SecurityProfile::Container.isolation(), IsolationMode::Container);
        assert_eq!(SecurityProfile::Local.syscall_filter(), SyscallFilter::Unfiltered);
        assert!(!SecurityProfile::Local.isolates_network());
        assert!("gvisor".parse::<SecurityProfile>().is_err());
        for profile in SecurityProfile::all_variants() {
            assert_eq!(profile.to_string().parse::<SecurityProfile>().unwrap(), *profile);
        }
    }

    #[test]
    fn test_root_identity_rejected() {
        let mut root = policy();
        root.uid = 0;
        assert!(matches!(
            root.validate(),
            Err(ConfigError::Invalid {
                option: "sandboxUid",
                ..
            })
        ));
    }
}
