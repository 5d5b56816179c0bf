use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::policy::SecurityProfile;

/// Path of the optional JSON config file
pub const CONFIG_FILE_ENV: &str = "LEANFARM_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option {0}")]
    Missing(&'static str),
    #[error("invalid value for {option}: {reason}")]
    Invalid { option: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn invalid(option: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        option,
        reason: reason.into(),
    }
}

/// Egress policy for sandboxes; deny-all is the only supported mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkPolicy {
    DenyAll,
}

impl FromStr for NetworkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "denyall" => Ok(NetworkPolicy::DenyAll),
            other => Err(format!("unsupported network policy {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackendKind {
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(SandboxBackendKind::Docker),
            "process" => Ok(SandboxBackendKind::Process),
            other => Err(format!("unknown sandbox backend {:?}", other)),
        }
    }
}

impl fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxBackendKind::Docker => write!(f, "docker"),
            SandboxBackendKind::Process => write!(f, "process"),
        }
    }
}

/// Where artifacts live, chosen by URL scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEndpoint {
    File(PathBuf),
    S3 { url: String },
    Memory,
}

impl FromStr for StorageEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory://" || s == "memory:" {
            return Ok(StorageEndpoint::Memory);
        }
        if let Some(path) = s.strip_prefix("file://") {
            let path = Path::new(path);
            if !path.is_absolute() {
                return Err(format!("file endpoint must be absolute, got {:?}", s));
            }
            return Ok(StorageEndpoint::File(path.to_path_buf()));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(StorageEndpoint::S3 { url: s.to_string() });
        }
        Err(format!(
            "unsupported storage endpoint {:?} (expected file://, http(s):// or memory://)",
            s
        ))
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| invalid(name, format!("{:?}: {}", raw, e))),
    }
}

macro_rules! raw_config {
    ($($field:ident: $ty:ty => $env:literal),* $(,)?) => {
        /// Partially specified configuration, as read from a file or the environment
        #[derive(Debug, Clone, Default, Deserialize)]
        #[serde(rename_all = "camelCase", deny_unknown_fields)]
        pub struct RawConfig {
            $(pub $field: Option<$ty>,)*
        }

        impl RawConfig {
            /// Parse from `NAME=value` pairs
            pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
            where
                I: IntoIterator<Item = (K, V)>,
                K: Into<String>,
                V: Into<String>,
            {
                let vars: HashMap<String, String> =
                    vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
                let mut raw = Self {
                    $($field: parse_var(&vars, $env)?,)*
                };
                if raw.worker_id.is_none() {
                    raw.worker_id = parse_var(&vars, "HOSTNAME")?;
                }
                Ok(raw)
            }

            /// Values present in `other` win
            pub fn overlay(self, other: RawConfig) -> RawConfig {
                RawConfig {
                    $($field: other.$field.or(self.$field),)*
                }
            }
        }
    };
}

raw_config! {
    concurrency_ceiling: usize => "CONCURRENCY_CEILING",
    max_attempts: u32 => "MAX_ATTEMPTS",
    job_timeout_seconds: u64 => "JOB_TIMEOUT_SECONDS",
    memory_ceiling_bytes: u64 => "MEMORY_CEILING_BYTES",
    cpu_ceiling_cores: f64 => "CPU_CEILING_CORES",
    network_policy: NetworkPolicy => "NETWORK_POLICY",
    scratch_dir_quota_bytes: u64 => "SCRATCH_DIR_QUOTA_BYTES",
    artifact_key_prefix: String => "ARTIFACT_KEY_PREFIX",
    storage_endpoint: String => "STORAGE_ENDPOINT",
    artifact_bucket: String => "ARTIFACT_BUCKET",
    redis_url: String => "REDIS_URL",
    worker_id: String => "WORKER_ID",
    security_profile: SecurityProfile => "SECURITY_PROFILE",
    sandbox_backend: SandboxBackendKind => "SANDBOX_BACKEND",
    sandbox_image: String => "SANDBOX_IMAGE",
    sandbox_uid: u32 => "SANDBOX_UID",
    sandbox_gid: u32 => "SANDBOX_GID",
    process_ceiling: u32 => "PROCESS_CEILING",
    open_files_ceiling: u32 => "OPEN_FILES_CEILING",
    output_capture_bytes: usize => "OUTPUT_CAPTURE_BYTES",
    scratch_root: PathBuf => "SCRATCH_ROOT",
    lease_ttl_seconds: u64 => "LEASE_TTL_SECONDS",
    heartbeat_interval_seconds: u64 => "HEARTBEAT_INTERVAL_SECONDS",
    termination_grace_seconds: u64 => "TERMINATION_GRACE_SECONDS",
    health_stale_seconds: u64 => "HEALTH_STALE_SECONDS",
    http_bind_addr: String => "HTTP_BIND_ADDR",
}

impl RawConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Non-UTF-8 variables cannot hold any of our options
        Self::from_vars(
            env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Validated worker configuration
/// Every option has a default except the storage endpoint
#[derive(Debug, Clone)]
pub struct Config {
    pub concurrency_ceiling: usize,
    pub max_attempts: u32,
    pub job_timeout_seconds: u64,
    pub memory_ceiling_bytes: u64,
    pub cpu_ceiling_cores: f64,
    pub network_policy: NetworkPolicy,
    pub scratch_dir_quota_bytes: u64,
    pub artifact_key_prefix: String,
    pub storage_endpoint: StorageEndpoint,
    pub artifact_bucket: String,
    pub redis_url: String,
    pub worker_id: String,
    pub security_profile: SecurityProfile,
    pub sandbox_backend: SandboxBackendKind,
    pub sandbox_image: String,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    pub process_ceiling: u32,
    pub open_files_ceiling: u32,
    pub output_capture_bytes: usize,
    pub scratch_root: PathBuf,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub termination_grace: Duration,
    pub health_stale_after: Duration,
    pub http_bind_addr: SocketAddr,
}

impl Config {
    /// `.env`, then the optional JSON file, then the process environment
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match env::var_os(CONFIG_FILE_ENV) {
            Some(path) => RawConfig::from_file(PathBuf::from(path))?,
            None => RawConfig::default(),
        };
        Self::from_raw(file.overlay(RawConfig::from_env()?))
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let concurrency_ceiling = raw.concurrency_ceiling.unwrap_or(4);
        if !(1..=1024).contains(&concurrency_ceiling) {
            return Err(invalid("concurrencyCeiling", "must be between 1 and 1024"));
        }
        let max_attempts = raw.max_attempts.unwrap_or(3);
        if max_attempts == 0 {
            return Err(invalid("maxAttempts", "must be at least 1"));
        }
        let job_timeout_seconds = positive("jobTimeoutSeconds", raw.job_timeout_seconds.unwrap_or(300))?;
        let memory_ceiling_bytes = positive(
            "memoryCeilingBytes",
            raw.memory_ceiling_bytes.unwrap_or(4 * 1024 * 1024 * 1024),
        )?;
        let cpu_ceiling_cores = raw.cpu_ceiling_cores.unwrap_or(2.0);
        if !cpu_ceiling_cores.is_finite() || cpu_ceiling_cores <= 0.0 {
            return Err(invalid("cpuCeilingCores", "must be a positive number"));
        }
        let scratch_dir_quota_bytes = positive(
            "scratchDirQuotaBytes",
            raw.scratch_dir_quota_bytes.unwrap_or(1024 * 1024 * 1024),
        )?;

        let artifact_key_prefix = normalize_prefix(
            raw.artifact_key_prefix.as_deref().unwrap_or("leanfarm"),
        )?;
        let storage_endpoint = raw
            .storage_endpoint
            .ok_or(ConfigError::Missing("storageEndpoint"))?
            .parse::<StorageEndpoint>()
            .map_err(|e| invalid("storageEndpoint", e))?;
        let artifact_bucket = non_empty(
            "artifactBucket",
            raw.artifact_bucket.unwrap_or_else(|| "leanfarm-artifacts".to_string()),
        )?;

        let redis_url = raw
            .redis_url
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
        if !["redis://", "rediss://", "redis+unix://", "unix://"]
            .iter()
            .any(|scheme| redis_url.starts_with(scheme))
        {
            return Err(invalid("redisUrl", format!("unsupported scheme in {:?}", redis_url)));
        }
        let worker_id = raw
            .worker_id
            .unwrap_or_else(|| format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]));

        let sandbox_image = non_empty(
            "sandboxImage",
            raw.sandbox_image
                .unwrap_or_else(|| "leanprover/lean4:4.7.0".to_string()),
        )?;
        let output_capture_bytes = raw.output_capture_bytes.unwrap_or(64 * 1024);
        if output_capture_bytes == 0 {
            return Err(invalid("outputCaptureBytes", "must be at least 1"));
        }

        let lease_ttl_seconds = positive("leaseTtlSeconds", raw.lease_ttl_seconds.unwrap_or(30))?;
        let heartbeat_interval_seconds = positive(
            "heartbeatIntervalSeconds",
            raw.heartbeat_interval_seconds.unwrap_or(10),
        )?;
        if heartbeat_interval_seconds >= lease_ttl_seconds {
            return Err(invalid(
                "heartbeatIntervalSeconds",
                format!(
                    "must be below leaseTtlSeconds ({} >= {})",
                    heartbeat_interval_seconds, lease_ttl_seconds
                ),
            ));
        }
        let termination_grace_seconds = positive(
            "terminationGraceSeconds",
            raw.termination_grace_seconds.unwrap_or(5),
        )?;
        let health_stale_seconds = positive("healthStaleSeconds", raw.health_stale_seconds.unwrap_or(60))?;

        let http_bind_addr = raw
            .http_bind_addr
            .as_deref()
            .unwrap_or("0.0.0.0:8080")
            .parse::<SocketAddr>()
            .map_err(|e| invalid("httpBindAddr", e.to_string()))?;

        Ok(Self {
            concurrency_ceiling,
            max_attempts,
            job_timeout_seconds,
            memory_ceiling_bytes,
            cpu_ceiling_cores,
            network_policy: raw.network_policy.unwrap_or(NetworkPolicy::DenyAll),
            scratch_dir_quota_bytes,
            artifact_key_prefix,
            storage_endpoint,
            artifact_bucket,
            redis_url,
            worker_id,
            security_profile: raw.security_profile.unwrap_or(SecurityProfile::Hardened),
            sandbox_backend: raw.sandbox_backend.unwrap_or(SandboxBackendKind::Docker),
            sandbox_image,
            sandbox_uid: raw.sandbox_uid.unwrap_or(1000),
            sandbox_gid: raw.sandbox_gid.unwrap_or(1000),
            process_ceiling: raw.process_ceiling.unwrap_or(100),
            open_files_ceiling: raw.open_files_ceiling.unwrap_or(1024),
            output_capture_bytes,
            scratch_root: raw
                .scratch_root
                .unwrap_or_else(|| PathBuf::from("/var/lib/leanfarm/scratch")),
            lease_ttl: Duration::from_secs(lease_ttl_seconds),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_seconds),
            termination_grace: Duration::from_secs(termination_grace_seconds),
            health_stale_after: Duration::from_secs(health_stale_seconds),
            http_bind_addr,
        })
    }

    /// Delay between a failed attempt and its next claim
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), self.max_attempts)
    }

    pub fn storage_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(5), 5)
    }

    /// Idle claim polling
    pub fn poll_backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(5), u32::MAX)
    }
}

fn positive(option: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(invalid(option, "must be greater than zero"));
    }
    Ok(value)
}

fn non_empty(option: &'static str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(option, "must not be empty"));
    }
    Ok(value)
}

/// Prefixes become path segments in every backend, so keep them boring
fn normalize_prefix(prefix: &str) -> Result<String, ConfigError> {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let valid_chars = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    let valid_segments = trimmed
        .split('/')
        .all(|s| !s.is_empty() && s != "." && s != ".." && s != "sha256");
    if !valid_chars || !valid_segments {
        return Err(invalid(
            "artifactKeyPrefix",
            format!("{:?} is not a relative path of plain segments", prefix),
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> RawConfig {
        RawConfig::from_vars(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_raw(vars(&[("STORAGE_ENDPOINT", "memory://")])).unwrap();
        assert_eq!(config.concurrency_ceiling, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.job_timeout_seconds, 300);
        assert_eq!(config.memory_ceiling_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.cpu_ceiling_cores, 2.0);
        assert_eq!(config.network_policy, NetworkPolicy::DenyAll);
        assert_eq!(config.artifact_key_prefix, "leanfarm");
        assert_eq!(config.storage_endpoint, StorageEndpoint::Memory);
        assert_eq!(config.security_profile, SecurityProfile::Hardened);
        assert_eq!(config.sandbox_backend, SandboxBackendKind::Docker);
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.http_bind_addr.port(), 8080);
    }

    #[test]
    fn test_storage_endpoint_required() {
        let err = Config::from_raw(vars(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("storageEndpoint")));
    }

    #[test]
    fn test_storage_endpoint_schemes() {
        assert_eq!(
            "file:///srv/artifacts".parse::<StorageEndpoint>().unwrap(),
            StorageEndpoint::File(PathBuf::from("/srv/artifacts"))
        );
        assert!(matches!(
            "http://minio:9000".parse::<StorageEndpoint>().unwrap(),
            StorageEndpoint::S3 { .. }
        ));
        assert!("file://relative/dir".parse::<StorageEndpoint>().is_err());
        assert!("ftp://host".parse::<StorageEndpoint>().is_err());
    }

    #[test]
    fn test_malformed_numbers_fail_fast() {
        let err = RawConfig::from_vars([("MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { option: "MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn test_heartbeat_must_be_below_ttl() {
        let err = Config::from_raw(vars(&[
            ("STORAGE_ENDPOINT", "memory://"),
            ("LEASE_TTL_SECONDS", "10"),
            ("HEARTBEAT_INTERVAL_SECONDS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                option: "heartbeatIntervalSeconds",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_limits_rejected() {
        for (name, option) in [
            ("CONCURRENCY_CEILING", "concurrencyCeiling"),
            ("MAX_ATTEMPTS", "maxAttempts"),
            ("JOB_TIMEOUT_SECONDS", "jobTimeoutSeconds"),
            ("MEMORY_CEILING_BYTES", "memoryCeilingBytes"),
            ("CPU_CEILING_CORES", "cpuCeilingCores"),
        ] {
            let err = Config::from_raw(vars(&[("STORAGE_ENDPOINT", "memory://"), (name, "0")]))
                .unwrap_err();
            match err {
                ConfigError::Invalid { option: got, .. } => assert_eq!(got, option),
                other => panic!("unexpected error for {}: {}", name, other),
            }
        }
    }

    #[test]
    fn test_unknown_network_policy_rejected() {
        assert!(RawConfig::from_vars([("NETWORK_POLICY", "allowAll")]).is_err());
        assert_eq!("deny-all".parse::<NetworkPolicy>().unwrap(), NetworkPolicy::DenyAll);
    }

    #[test]
    fn test_prefix_validation() {
        assert_eq!(normalize_prefix("proofs/out/").unwrap(), "proofs/out");
        assert_eq!(normalize_prefix("").unwrap(), "");
        assert!(normalize_prefix("../escape").is_err());
        assert!(normalize_prefix("/abs").is_err());
        assert!(normalize_prefix("a b").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"concurrencyCeiling": 8, "storageEndpoint": "memory://", "securityProfile": "local"}}"#
        )
        .unwrap();

        let from_file = RawConfig::from_file(file.path()).unwrap();
        let merged = from_file.overlay(vars(&[("CONCURRENCY_CEILING", "2")]));
        let config = Config::from_raw(merged).unwrap();
        assert_eq!(config.concurrency_ceiling, 2);
        assert_eq!(config.security_profile, SecurityProfile::Local);
    }

    #[test]
    fn test_unknown_file_option_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"concurency": 8}}"#).unwrap();
        assert!(matches!(
            RawConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_worker_id_falls_back_to_hostname() {
        let raw = vars(&[("HOSTNAME", "farm-7"), ("STORAGE_ENDPOINT", "memory://")]);
        assert_eq!(Config::from_raw(raw).unwrap().worker_id, "farm-7");
    }
}
