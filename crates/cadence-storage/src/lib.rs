//! Cadence Storage Library
//!
//! Storage abstraction and backends (S3 via object_store, local filesystem) for
//! the artifacts a transcode publishes.
//!
//! # Storage key format
//!
//! All backends share one key layout, generated in the `keys` module:
//!
//! - **Derived artifacts**: `{owner_id}/transcoded/{upload_id}/{artifact}`
//! - **Original input**: `{owner_id}/originals/{YYYY-MM}/{upload_id}/{file_name}`
//!
//! Keys must not contain `..` or a leading `/`.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use cadence_core::StorageBackend;
pub use factory::create_storage;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{ObjectInfo, Storage, StorageError, StorageResult};
