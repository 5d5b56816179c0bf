//! Fixtures shared by the worker's unit tests

use leanfarm_common::config::NetworkPolicy;
use leanfarm_common::policy::{build_sandbox_spec, SandboxSpec, SecurityPolicy, SecurityProfile};
use leanfarm_common::{ArtifactKey, Job, ResourceRequest};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use crate::engine::SandboxLayout;

pub const MIB: u64 = 1024 * 1024;

pub fn local_policy() -> SecurityPolicy {
    SecurityPolicy {
        profile: SecurityProfile::Local,
        uid: 1000,
        gid: 1000,
        cpu_ceiling_cores: 8.0,
        memory_ceiling_bytes: 4096 * MIB,
        timeout_ceiling: Duration::from_secs(60),
        process_ceiling: 100,
        open_files_ceiling: 256,
        scratch_quota_bytes: 64 * MIB,
        network: NetworkPolicy::DenyAll,
    }
}

pub fn sh_job(script: &str, timeout_seconds: Option<u64>) -> Job {
    Job::new(
        ArtifactKey::for_content("leanfarm", b"bundle"),
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        ResourceRequest {
            cpu_cores: 1.0,
            memory_bytes: 512 * MIB,
            timeout_seconds,
        },
    )
}

pub fn local_spec(timeout: Duration) -> SandboxSpec {
    let mut spec = build_sandbox_spec(&sh_job("true", None), &local_policy()).unwrap();
    spec.timeout = timeout;
    spec
}

/// A scratch base a dropped-privilege payload can traverse
pub fn scratch_base() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

/// Layout under `dir` writable by any sandbox identity
pub fn prepared_layout(dir: &Path) -> SandboxLayout {
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).unwrap();
    let layout = SandboxLayout {
        bundle_file: dir.join("bundle"),
        work_dir: dir.join("work"),
        output_dir: dir.join("output"),
    };
    std::fs::write(&layout.bundle_file, b"bundle").unwrap();
    for path in [&layout.work_dir, &layout.output_dir] {
        std::fs::create_dir(path).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)).unwrap();
    }
    layout
}
