use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::info;

use super::{ArtifactKey, ArtifactStore, PutOutcome, StorageError};

/// S3-compatible object storage (AWS, MinIO, Ceph RGW)
/// Uses path-style addressing so self-hosted endpoints work without DNS tricks
pub struct S3ArtifactStore {
    client: S3Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub async fn connect(endpoint: &str, bucket: &str) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        info!(endpoint, bucket, "Connected artifact store to S3 endpoint");
        Self {
            client: S3Client::from_conf(s3_config),
            bucket: bucket.to_string(),
        }
    }
}

fn classify<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ConstructionFailure(_) => StorageError::Permanent(message),
        SdkError::ServiceError(ref service) => classify_status(service.raw().status().as_u16(), message),
        _ => StorageError::Transient(message),
    }
}

/// Client errors (bad credentials, missing bucket) never heal on retry;
/// throttling, request timeouts and server errors might
fn classify_status(status: u16, message: String) -> StorageError {
    match status {
        408 | 429 => StorageError::Transient(message),
        400..=499 => StorageError::Permanent(message),
        _ => StorageError::Transient(message),
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PutOutcome, StorageError> {
        key.verify(bytes)?;
        if self.exists(key).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(ByteStream::from(bytes.to_vec()))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(classify)?;
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StorageError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if err.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(classify(err)),
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        let bytes = body.into_bytes().to_vec();
        key.verify(&bytes)?;
        Ok(bytes)
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => {
                Ok(false)
            }
            Err(err) => Err(classify(err)),
        }
    }
}
