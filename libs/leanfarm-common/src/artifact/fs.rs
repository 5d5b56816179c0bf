use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use super::{ArtifactKey, ArtifactStore, PutOutcome, StorageError};

/// Filesystem-backed store
/// Writes go to a temp file in the target directory and are renamed into place,
/// so a reader never observes a partially written artifact
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| map_io(&root, e))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.as_str())
    }
}

fn map_io(path: &Path, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            StorageError::Permanent(format!("{}: {}", path.display(), err))
        }
        _ => StorageError::Transient(format!("{}: {}", path.display(), err)),
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PutOutcome, StorageError> {
        key.verify(bytes)?;
        if self.exists(key).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let path = self.path_for(key);
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).await.map_err(|e| map_io(parent, e))?;

        let tmp = parent.join(format!(".{}.{}.tmp", key.digest(), Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(map_io(&tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(map_io(&path, e));
        }
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key);
        let bytes = fs::read(&path).await.map_err(|e| map_io(&path, e))?;
        key.verify(&bytes)?;
        Ok(bytes)
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, StorageError> {
        let path = self.path_for(key);
        fs::try_exists(&path).await.map_err(|e| map_io(&path, e))
    }
}
