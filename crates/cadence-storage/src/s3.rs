//! S3 (and S3-compatible) backend on object_store.
//!
//! Credentials come from the usual `AWS_*` environment variables. With a custom
//! endpoint (MinIO etc.) URLs are path-style and plain HTTP is allowed.

use crate::keys::validate_key;
use crate::traits::{ObjectInfo, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, ObjectStoreExt, PutOptions,
    PutPayload,
};
use std::time::Instant;

#[derive(Clone)]
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
}

fn object_path(key: &str) -> StorageResult<Path> {
    validate_key(key)?;
    Ok(Path::from(key))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

impl S3Storage {
    pub fn new(bucket: String, region: String, endpoint_url: Option<String>) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region.as_str())
            .with_bucket_name(bucket.as_str());

        if let Some(endpoint) = endpoint_url.as_deref() {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(format!("S3 bucket {}: {}", bucket, e)))?;

        tracing::info!(
            bucket = %bucket,
            region = %region,
            endpoint = endpoint_url.as_deref().unwrap_or("aws"),
            "S3 storage configured"
        );

        Ok(Self {
            store,
            bucket,
            region,
            endpoint_url,
        })
    }

    /// Path-style under a custom endpoint, virtual-hosted style on AWS.
    fn object_url(&self, key: &str) -> String {
        match self.endpoint_url.as_deref() {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<String> {
        let location = object_path(key)?;
        let size_bytes = data.len() as u64;
        let start = Instant::now();

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };

        if let Err(e) = self
            .store
            .put_opts(&location, PutPayload::from(Bytes::from(data)), opts)
            .await
        {
            tracing::error!(
                bucket = %self.bucket,
                key = %key,
                size_bytes,
                duration_ms = elapsed_ms(start),
                error = %e,
                "S3 put failed"
            );
            return Err(StorageError::UploadFailed(format!("{}: {}", key, e)));
        }

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes,
            content_type,
            duration_ms = elapsed_ms(start),
            "Object stored"
        );
        Ok(self.object_url(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let location = object_path(key)?;
        let start = Instant::now();

        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(ObjectStoreError::NotFound { .. }) => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => {
                tracing::error!(bucket = %self.bucket, key = %key, error = %e, "S3 get failed");
                return Err(StorageError::DownloadFailed(format!("{}: {}", key, e)));
            }
        };

        let bytes = result
            .bytes()
            .await
            .map_err(|e| StorageError::DownloadFailed(format!("{}: {}", key, e)))?;

        tracing::debug!(
            key = %key,
            size_bytes = bytes.len(),
            duration_ms = elapsed_ms(start),
            "Object fetched"
        );
        Ok(bytes.to_vec())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        let location = object_path(key)?;
        let opts = GetOptions {
            head: true,
            ..Default::default()
        };

        match self.store.get_opts(&location, opts).await {
            Ok(result) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size_bytes: result.meta.size,
                content_type: result
                    .attributes
                    .get(&Attribute::ContentType)
                    .map(|value| value.to_string()),
            })),
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(StorageError::BackendError(format!("{}: {}", key, e))),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let location = object_path(key)?;

        match self.store.delete(&location).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {
                tracing::debug!(bucket = %self.bucket, key = %key, "Object deleted");
                Ok(())
            }
            Err(e) => {
                tracing::error!(bucket = %self.bucket, key = %key, error = %e, "S3 delete failed");
                Err(StorageError::DeleteFailed(format!("{}: {}", key, e)))
            }
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // object_store lists by path segment, so list the enclosing directory and filter.
        let dir = prefix.trim_end_matches('/');
        let location = (!dir.is_empty()).then(|| Path::from(dir));

        let mut keys: Vec<String> = self
            .store
            .list(location.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(endpoint: Option<&str>) -> S3Storage {
        S3Storage::new(
            "tracks".to_string(),
            "eu-west-1".to_string(),
            endpoint.map(String::from),
        )
        .unwrap()
    }

    #[test]
    fn urls_follow_endpoint_style() {
        assert_eq!(
            storage(None).object_url("u/transcoded/t/audio_128.mp3"),
            "https://tracks.s3.eu-west-1.amazonaws.com/u/transcoded/t/audio_128.mp3"
        );
        assert_eq!(
            storage(Some("http://localhost:9000/")).object_url("k.json"),
            "http://localhost:9000/tracks/k.json"
        );
    }

    #[test]
    fn traversal_keys_never_reach_the_store() {
        assert!(matches!(object_path("../x"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(object_path("/abs"), Err(StorageError::InvalidKey(_))));
        assert!(object_path("a/b.mp3").is_ok());
    }
}
