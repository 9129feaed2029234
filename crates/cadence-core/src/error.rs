//! Error types module
//!
//! `PipelineError` is the single error every transcoding stage bubbles up to the
//! orchestrator. Its variants follow the pipeline's failure taxonomy:
//!
//! - input errors (missing/empty/mistyped temp file) never consume a retry
//! - transcode and storage errors are retried by the durable queue backend
//!   (a tool that is missing, crashes or exits non-zero counts as a transcode error)
//! - a Track that already exists is always terminal and needs an operator

use uuid::Uuid;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected failures such as rejected input
    Debug,
    /// Recoverable issues that will be retried
    Warn,
    /// Failures that need attention
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Input rejected: {0}")]
    Input(String),

    #[error("Audio analysis failed: {0}")]
    Analysis(String),

    #[error("Transcode failed: {0}")]
    Transcode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Track {0} is already materialized; manual cleanup required")]
    AlreadyMaterialized(Uuid),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Static metadata per variant: (error_code, recoverable, log_level).
fn pipeline_error_static_metadata(err: &PipelineError) -> (&'static str, bool, LogLevel) {
    match err {
        PipelineError::Input(_) => ("INPUT_REJECTED", false, LogLevel::Debug),
        PipelineError::Analysis(_) => ("ANALYSIS_FAILED", false, LogLevel::Warn),
        PipelineError::Transcode(_) => ("TRANSCODE_FAILED", true, LogLevel::Warn),
        PipelineError::Storage(_) => ("STORAGE_ERROR", true, LogLevel::Warn),
        PipelineError::Persistence(_) => ("PERSISTENCE_ERROR", true, LogLevel::Error),
        PipelineError::AlreadyMaterialized(_) => ("ALREADY_MATERIALIZED", false, LogLevel::Error),
        PipelineError::Internal(_) => ("INTERNAL_ERROR", true, LogLevel::Error),
    }
}

impl PipelineError {
    /// Machine-readable error code for structured logs.
    pub fn error_code(&self) -> &'static str {
        pipeline_error_static_metadata(self).0
    }

    /// Whether the queue may re-attempt the job after this error.
    pub fn is_recoverable(&self) -> bool {
        pipeline_error_static_metadata(self).1
    }

    pub fn log_level(&self) -> LogLevel {
        pipeline_error_static_metadata(self).2
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Internal(format!("JSON error: {}", err))
    }
}
