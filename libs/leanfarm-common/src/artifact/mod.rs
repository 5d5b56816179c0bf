//! Artifact Store Client
//!
//! Immutable, content-addressed blobs. A key is `{prefix}/sha256/{hex}` and
//! always names the SHA-256 of its bytes, so concurrent writers racing on the
//! same key can only ever write the same content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::backoff::RetryPolicy;
use crate::config::{Config, StorageEndpoint};

pub mod fs;
pub mod memory;
pub mod s3;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;
pub use s3::S3ArtifactStore;

const DIGEST_SEGMENT: &str = "sha256";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("content does not match artifact key {key}")]
    ContentMismatch { key: String },
    #[error("invalid artifact key: {0}")]
    InvalidKey(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Permanent(String),
    #[error("storage operation failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl StorageError {
    /// Only transient errors are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Content-addressed artifact location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn for_content(prefix: &str, bytes: &[u8]) -> Self {
        let digest = sha256_hex(bytes);
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            Self(format!("{}/{}", DIGEST_SEGMENT, digest))
        } else {
            Self(format!("{}/{}/{}", prefix, DIGEST_SEGMENT, digest))
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidKey(raw.to_string());
        let mut segments = raw.rsplit('/');
        let digest = segments.next().ok_or_else(invalid)?;
        let algorithm = segments.next().ok_or_else(invalid)?;
        let digest_ok = digest.len() == 64
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        let prefix_ok = segments.all(|s| !s.is_empty() && s != "." && s != "..");
        if algorithm != DIGEST_SEGMENT || !digest_ok || !prefix_ok || raw.starts_with('/') {
            return Err(invalid());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn digest(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `bytes` hash to this key
    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.digest() == sha256_hex(bytes)
    }

    pub fn verify(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.matches(bytes) {
            Ok(())
        } else {
            Err(StorageError::ContentMismatch {
                key: self.0.clone(),
            })
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Identical content already committed under the key
    AlreadyPresent,
}

/// Object-storage compatible put/get contract
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Commit `bytes` under `key`; the key must be the content address of the bytes
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PutOutcome, StorageError>;

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, StorageError>;
}

/// Derive the content address for `bytes` and store them
pub async fn put_content(
    store: &dyn ArtifactStore,
    prefix: &str,
    bytes: &[u8],
) -> Result<ArtifactKey, StorageError> {
    let key = ArtifactKey::for_content(prefix, bytes);
    store.put(&key, bytes).await?;
    Ok(key)
}

/// Bounded exponential backoff around any store
/// NotFound, ContentMismatch and other permanent errors surface immediately
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ArtifactStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, key: &ArtifactKey, mut call: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, StorageError>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts().max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(StorageError::RetriesExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.policy.delay_for(attempt - 1);
                    warn!(
                        operation = op,
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient storage error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<S: ArtifactStore> ArtifactStore for RetryingStore<S> {
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PutOutcome, StorageError> {
        self.with_retry("put", key, move || self.inner.put(key, bytes)).await
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StorageError> {
        self.with_retry("get", key, move || self.inner.get(key)).await
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, StorageError> {
        self.with_retry("exists", key, move || self.inner.exists(key)).await
    }
}

/// Build the configured backend wrapped in the storage retry policy
pub async fn open_store(config: &Config) -> Result<Arc<dyn ArtifactStore>, StorageError> {
    let policy = config.storage_retry_policy();
    let store: Arc<dyn ArtifactStore> = match &config.storage_endpoint {
        StorageEndpoint::File(root) => {
            Arc::new(RetryingStore::new(FsArtifactStore::open(root).await?, policy))
        }
        StorageEndpoint::S3 { url } => Arc::new(RetryingStore::new(
            S3ArtifactStore::connect(url, &config.artifact_bucket).await,
            policy,
        )),
        StorageEndpoint::Memory => Arc::new(MemoryArtifactStore::new()),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_key_layout() {
        let key = ArtifactKey::for_content("leanfarm/", b"theorem");
        assert!(key.as_str().starts_with("leanfarm/sha256/"));
        assert_eq!(key.digest().len(), 64);
        assert!(key.matches(b"theorem"));
        assert!(!key.matches(b"lemma"));

        let bare = ArtifactKey::for_content("", b"theorem");
        assert!(bare.as_str().starts_with("sha256/"));
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        let good = ArtifactKey::for_content("proofs/out", b"x");
        assert_eq!(ArtifactKey::parse(good.as_str()).unwrap(), good);

        assert!(ArtifactKey::parse("leanfarm/sha256/abc").is_err());
        assert!(ArtifactKey::parse("leanfarm/md5/0000").is_err());
        assert!(ArtifactKey::parse(&format!("../sha256/{}", good.digest())).is_err());
        assert!(ArtifactKey::parse(&format!("/abs/sha256/{}", good.digest())).is_err());
        assert!(ArtifactKey::parse(&format!("a/sha256/{}", good.digest().to_uppercase())).is_err());
    }

    #[test]
    fn test_key_serde_validates() {
        let key = ArtifactKey::for_content("p", b"x");
        let json = serde_json::to_string(&key).unwrap();
        let back: ArtifactKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<ArtifactKey>("\"not/a/key\"").is_err());
    }

    /// Fails the first `failures` calls with a transient error
    struct FlakyStore {
        inner: MemoryArtifactStore,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArtifactStore for FlakyStore {
        async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PutOutcome, StorageError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StorageError::Transient("503 slow down".into()));
            }
            self.inner.put(key, bytes).await
        }

        async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn exists(&self, key: &ArtifactKey) -> Result<bool, StorageError> {
            self.inner.exists(key).await
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), max_attempts)
    }

    #[tokio::test]
    async fn test_retrying_store_recovers_from_transient_errors() {
        let store = RetryingStore::new(
            FlakyStore {
                inner: MemoryArtifactStore::new(),
                failures: 2,
                calls: AtomicU32::new(0),
            },
            fast_policy(5),
        );
        let key = put_content(&store, "leanfarm", b"proof").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"proof");
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retrying_store_gives_up() {
        let store = RetryingStore::new(
            FlakyStore {
                inner: MemoryArtifactStore::new(),
                failures: u32::MAX,
                calls: AtomicU32::new(0),
            },
            fast_policy(3),
        );
        let err = put_content(&store, "leanfarm", b"proof").await.unwrap_err();
        assert!(matches!(err, StorageError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let store = RetryingStore::new(
            FlakyStore {
                inner: MemoryArtifactStore::new(),
                failures: 0,
                calls: AtomicU32::new(0),
            },
            fast_policy(5),
        );
        let key = ArtifactKey::for_content("leanfarm", b"missing");
        assert!(matches!(store.get(&key).await, Err(StorageError::NotFound(_))));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }
}
