//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use crate::StorageBackend;
use async_trait::async_trait;
use cadence_core::PipelineError;
use std::path::Path;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

/// Metadata returned by `Storage::head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
}

/// Storage abstraction trait
///
/// The pipeline treats the backend as a reliable key-value blob store and
/// relies only on `put`, `get`/`head`, `delete` and `list`. Implementations
/// must be safe for concurrent use by every worker slot.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `data` under `key`, overwriting any existing object. Returns the public URL.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<String>;

    /// Read an object fully into memory
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Object metadata, or `None` if the key does not exist
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>>;

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// All keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Upload a local file to `key`.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> StorageResult<String> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        self.put(key, data, content_type).await
    }

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}
