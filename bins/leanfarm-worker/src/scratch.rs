use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::geteuid;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::engine::SandboxLayout;

const BUNDLE_NAME: &str = "bundle";

/// Files the payload left in its output directory
#[derive(Debug, Default)]
pub struct CollectedOutputs {
    /// (file name, contents), sorted by name
    pub files: Vec<(String, Vec<u8>)>,
    pub total_bytes: u64,
    pub quota_exceeded: bool,
}

/// Per-execution writable storage
///
/// Layout: `{base}/{job_id}-{uuid}/{bundle,work,output}`. Removed by
/// `cleanup`, or on drop if nobody called it.
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
    layout: SandboxLayout,
    removed: bool,
}

impl ScratchDir {
    /// `owner` is the sandbox identity; only applied when the worker is root
    pub async fn create(base: &Path, job_id: Uuid, owner: (u32, u32)) -> io::Result<Self> {
        let root = base.join(format!("{}-{}", job_id, Uuid::new_v4().simple()));
        let layout = SandboxLayout {
            bundle_file: root.join("bundle").join(BUNDLE_NAME),
            work_dir: root.join("work"),
            output_dir: root.join("output"),
        };
        let mut scratch = Self {
            root,
            layout,
            removed: false,
        };

        // From here on a failure still removes whatever was created
        tokio::fs::create_dir_all(base).await?;
        tokio::fs::create_dir(&scratch.root).await?;
        for dir in ["bundle", "work", "output"] {
            tokio::fs::create_dir(scratch.root.join(dir)).await?;
        }
        if let Err(e) = scratch.grant(owner).await {
            scratch.cleanup().await;
            return Err(e);
        }
        Ok(scratch)
    }

    async fn grant(&mut self, (uid, gid): (u32, u32)) -> io::Result<()> {
        set_mode(&self.root, 0o711).await?;
        set_mode(&self.root.join("bundle"), 0o755).await?;
        if geteuid().is_root() {
            for dir in [&self.layout.work_dir, &self.layout.output_dir] {
                std::os::unix::fs::chown(dir, Some(uid), Some(gid))?;
                set_mode(dir, 0o770).await?;
            }
        } else {
            // Cannot chown; a container user with another uid still needs to write
            for dir in [&self.layout.work_dir, &self.layout.output_dir] {
                set_mode(dir, 0o777).await?;
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Place the code bundle, read-only for everyone
    pub async fn write_bundle(&self, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::write(&self.layout.bundle_file, bytes).await?;
        set_mode(&self.layout.bundle_file, 0o444).await
    }

    /// Read every regular file directly inside `output/`
    ///
    /// Each file is opened without following symlinks and checked on the
    /// open handle, so a payload that swaps in a link or a FIFO after the
    /// listing cannot point the worker at anything outside its sandbox.
    /// Reading stops once the quota is exceeded.
    pub async fn collect_outputs(&self, quota_bytes: u64) -> io::Result<CollectedOutputs> {
        let mut entries = tokio::fs::read_dir(&self.layout.output_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(path = %entry.path().display(), "Skipping output with non UTF-8 name");
                continue;
            };
            names.push(name);
        }
        names.sort();

        let mut collected = CollectedOutputs::default();
        for name in names {
            let path = self.layout.output_dir.join(&name);
            let Some((file, len)) = open_regular(&path).await? else {
                debug!(path = %path.display(), "Skipping non-regular output entry");
                continue;
            };
            collected.total_bytes = collected.total_bytes.saturating_add(len);
            if collected.total_bytes > quota_bytes {
                collected.quota_exceeded = true;
                collected.files.clear();
                break;
            }
            let mut bytes = Vec::with_capacity(len as usize);
            file.take(len).read_to_end(&mut bytes).await?;
            collected.files.push((name, bytes));
        }
        Ok(collected)
    }

    /// Bytes allocated under `work/` and `output/`
    ///
    /// Entries that vanish mid-walk are skipped; the payload may still be
    /// running.
    pub async fn usage(&self) -> u64 {
        let dirs = [self.layout.work_dir.clone(), self.layout.output_dir.clone()];
        tokio::task::spawn_blocking(move || dirs.iter().map(|dir| allocated_bytes(dir)).sum::<u64>())
            .await
            .unwrap_or(u64::MAX)
    }

    /// Remove the whole tree; safe to call more than once
    pub async fn cleanup(&mut self) -> bool {
        if self.removed {
            return true;
        }
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                self.removed = true;
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.removed = true;
                true
            }
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "Failed to remove scratch directory");
                false
            }
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.root.display(), error = %e, "Failed to remove scratch directory on drop");
                }
            }
        }
    }
}

/// Open `path` only if it is a regular file, returning its size from the handle
async fn open_regular(path: &Path) -> io::Result<Option<(File, u64)>> {
    let opened = tokio::fs::OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path)
        .await;
    let file = match opened {
        Ok(file) => file,
        Err(e) if e.raw_os_error() == Some(Errno::ELOOP as i32) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let metadata = file.metadata().await?;
    if !metadata.file_type().is_file() {
        return Ok(None);
    }
    Ok(Some((file, metadata.len())))
}

fn allocated_bytes(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.blocks().saturating_mul(512))
        .fold(0u64, u64::saturating_add)
}

async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}
