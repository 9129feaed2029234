//! Upload intake
//!
//! Creates the `Queued` Upload for a raw file already written to a temp path
//! and enqueues its transcode job. The Upload id doubles as the job id and the
//! eventual Track id.

use cadence_core::models::{JobHandle, NewUpload, TranscodeJob, Upload};
use cadence_db::{DbError, UploadStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::queue::{JobQueue, QueueError};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Failed to record upload: {0}")]
    Db(#[from] DbError),

    #[error("Failed to enqueue transcode: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub upload: Upload,
    pub job: JobHandle,
}

#[derive(Clone)]
pub struct UploadIntake {
    uploads: Arc<dyn UploadStore>,
    queue: Arc<dyn JobQueue>,
}

impl UploadIntake {
    pub fn new(uploads: Arc<dyn UploadStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { uploads, queue }
    }

    /// Record the upload and queue it. If the queue refuses the job the Upload is
    /// marked `Failed` so pollers do not wait on it forever.
    #[tracing::instrument(skip(self, new_upload), fields(upload_id = %new_upload.id, user_id = %new_upload.user_id))]
    pub async fn submit(
        &self,
        new_upload: NewUpload,
        request_id: Option<String>,
    ) -> Result<Submission, IntakeError> {
        let upload = self.uploads.create(new_upload).await?;

        let temp_file_name = Path::new(&upload.temp_path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| upload.original_filename.clone());

        let job = TranscodeJob {
            upload_id: upload.id,
            user_id: upload.user_id,
            temp_path: upload.temp_path.clone(),
            temp_file_name,
            year_month: upload.year_month(),
            request_id,
        };

        match self.queue.enqueue(job).await {
            Ok(handle) => {
                tracing::info!(
                    mode = %self.queue.mode(),
                    size_bytes = upload.size_bytes,
                    mime_type = %upload.mime_type,
                    "Upload queued for transcoding"
                );
                Ok(Submission {
                    upload,
                    job: handle,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Enqueue failed, marking upload failed");
                let message = format!("Failed to enqueue transcode: {}", e);
                if let Err(db_err) = self.uploads.mark_failed(upload.id, &message).await {
                    tracing::error!(error = %db_err, "Failed to mark upload failed after enqueue error");
                }
                Err(IntakeError::Queue(e))
            }
        }
    }
}
