//! Cadence Core Library
//!
//! Domain models, error types and configuration shared by every cadence crate:
//! the Upload and Track records the pipeline touches, the queue-level
//! `TranscodeJob`, and the error taxonomy the worker uses to decide between
//! retrying and failing a job.

pub mod config;
pub mod constants;
pub mod error;
pub mod job_error;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use config::{Config, ProcessingConfig, QueueConfig, StorageConfig, TelemetryConfig};
pub use error::{LogLevel, PipelineError};
pub use job_error::{JobError, JobResultExt};
pub use storage_types::StorageBackend;
