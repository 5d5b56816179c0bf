use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ArtifactKey, ArtifactStore, PutOutcome, StorageError};

/// In-process store for development and tests
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<HashMap<ArtifactKey, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<'_, HashMap<ArtifactKey, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.blobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs().is_empty()
    }

    pub fn keys(&self) -> Vec<ArtifactKey> {
        self.blobs().keys().cloned().collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PutOutcome, StorageError> {
        key.verify(bytes)?;
        let mut blobs = self.blobs();
        if blobs.contains_key(key) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        blobs.insert(key.clone(), bytes.to_vec());
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StorageError> {
        self.blobs()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, StorageError> {
        Ok(self.blobs().contains_key(key))
    }
}
