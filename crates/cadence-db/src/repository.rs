//! Repository traits
//!
//! The worker only ever talks to these traits, so the pipeline runs the same
//! against Postgres and the in-memory stores.

use async_trait::async_trait;
use cadence_core::models::{NewTrack, NewUpload, Track, Upload};
use uuid::Uuid;

use crate::error::DbResult;

#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Insert a new upload in `Queued` state.
    async fn create(&self, upload: NewUpload) -> DbResult<Upload>;

    async fn get(&self, id: Uuid) -> DbResult<Option<Upload>>;

    /// Claim for processing. Allowed from every state except `Completed`.
    /// Clears any error left by a previous attempt.
    async fn mark_processing(&self, id: Uuid) -> DbResult<Upload>;

    /// Record the error of a failed attempt that will be retried. Status stays `Processing`.
    /// Completion goes through [`TrackStore::materialize`].
    async fn record_attempt_error(&self, id: Uuid, error: &str) -> DbResult<()>;

    /// Terminal failure. Rejected for `Completed` uploads.
    async fn mark_failed(&self, id: Uuid, error: &str) -> DbResult<()>;
}

#[async_trait]
pub trait TrackStore: Send + Sync {
    /// Insert a `Ready` track. Fails with `DbError::AlreadyMaterialized` if the id exists.
    async fn create(&self, track: NewTrack) -> DbResult<Track>;

    /// Insert a `Ready` track and move its upload from `Processing` to `Completed`
    /// as one unit. Either both writes land or neither does.
    async fn materialize(&self, track: NewTrack, upload_id: Uuid) -> DbResult<Track>;

    async fn get(&self, id: Uuid) -> DbResult<Option<Track>>;

    async fn list_by_owner(&self, owner_id: Uuid) -> DbResult<Vec<Track>>;
}
