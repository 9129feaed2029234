use async_trait::async_trait;
use cadence_core::models::{NewUpload, Upload, UploadStatus};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::error::{is_unique_violation, DbError, DbResult};
use crate::repository::UploadStore;

const UPLOAD_COLUMNS: &str = r#"
    id,
    user_id,
    original_filename,
    mime_type,
    size_bytes,
    temp_path,
    status,
    error,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PgUploadStore {
    pool: PgPool,
}

impl PgUploadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish "no such upload" from "upload in a state that forbids the update".
    async fn transition_error(&self, id: Uuid, to: UploadStatus) -> DbError {
        match self.get(id).await {
            Ok(Some(upload)) => DbError::InvalidTransition {
                id,
                from: upload.status,
                to,
            },
            Ok(None) => DbError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl UploadStore for PgUploadStore {
    #[tracing::instrument(skip(self, upload), fields(upload_id = %upload.id))]
    async fn create(&self, upload: NewUpload) -> DbResult<Upload> {
        let sql = format!(
            r#"
            INSERT INTO uploads (id, user_id, original_filename, mime_type, size_bytes, temp_path, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {UPLOAD_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<Postgres, Upload>(&sql)
            .bind(upload.id)
            .bind(upload.user_id)
            .bind(&upload.original_filename)
            .bind(&upload.mime_type)
            .bind(upload.size_bytes)
            .bind(&upload.temp_path)
            .bind(UploadStatus::Queued)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::Conflict(format!(
                        "upload {} or temp path {} already registered",
                        upload.id, upload.temp_path
                    ))
                } else {
                    tracing::error!(error = %e, upload_id = %upload.id, "Failed to insert upload");
                    DbError::Database(e)
                }
            })?;

        tracing::info!(upload_id = %created.id, user_id = %created.user_id, "Upload created");

        Ok(created)
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: Uuid) -> DbResult<Option<Upload>> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = $1");
        let upload = sqlx::query_as::<Postgres, Upload>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(upload)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_processing(&self, id: Uuid) -> DbResult<Upload> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = $2, error = NULL, updated_at = NOW()
            WHERE id = $1 AND status <> $3
            RETURNING {UPLOAD_COLUMNS}
            "#
        );

        let upload = sqlx::query_as::<Postgres, Upload>(&sql)
            .bind(id)
            .bind(UploadStatus::Processing)
            .bind(UploadStatus::Completed)
            .fetch_optional(&self.pool)
            .await?;

        match upload {
            Some(upload) => Ok(upload),
            None => Err(self.transition_error(id, UploadStatus::Processing).await),
        }
    }

    #[tracing::instrument(skip(self, error))]
    async fn record_attempt_error(&self, id: Uuid, error: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET error = $2, updated_at = NOW()
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(UploadStatus::Processing)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, UploadStatus::Processing).await);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_failed(&self, id: Uuid, error: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET status = $2, error = $3, updated_at = NOW()
            WHERE id = $1 AND status <> $4
            "#,
        )
        .bind(id)
        .bind(UploadStatus::Failed)
        .bind(error)
        .bind(UploadStatus::Completed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, UploadStatus::Failed).await);
        }

        tracing::warn!(upload_id = %id, error = %error, "Upload failed");
        Ok(())
    }
}
