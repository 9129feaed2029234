use cadence_core::models::UploadStatus;
use cadence_core::PipelineError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    /// A Track with this id exists already. Never retried; needs an operator.
    #[error("Track {0} already materialized")]
    AlreadyMaterialized(Uuid),

    #[error("Upload {0} not found")]
    NotFound(Uuid),

    #[error("Upload {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for PipelineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::AlreadyMaterialized(id) => PipelineError::AlreadyMaterialized(id),
            DbError::NotFound(_) | DbError::InvalidTransition { .. } => {
                PipelineError::Input(err.to_string())
            }
            DbError::Invalid(msg) => PipelineError::Internal(msg),
            DbError::Conflict(_) | DbError::Database(_) => {
                PipelineError::Persistence(err.to_string())
            }
        }
    }
}

/// True when a sqlx error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
