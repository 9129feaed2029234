//! In-memory Upload/Track stores
//!
//! Same transition rules and uniqueness guarantees as the Postgres repositories.
//! Used by tests and by `DATABASE_URL=memory://` runs.

use async_trait::async_trait;
use cadence_core::models::{NewTrack, NewUpload, Track, Upload, UploadStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::repository::{TrackStore, UploadStore};

#[derive(Clone, Default)]
pub struct InMemoryUploadStore {
    uploads: Arc<Mutex<HashMap<Uuid, Upload>>>,
}

impl InMemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to the upload if `allowed(status)` holds.
    async fn transition<F>(
        &self,
        id: Uuid,
        to: UploadStatus,
        allowed: fn(UploadStatus) -> bool,
        f: F,
    ) -> DbResult<Upload>
    where
        F: FnOnce(&mut Upload),
    {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads.get_mut(&id).ok_or(DbError::NotFound(id))?;
        if !allowed(upload.status) {
            return Err(DbError::InvalidTransition {
                id,
                from: upload.status,
                to,
            });
        }
        f(upload);
        upload.updated_at = Utc::now();
        Ok(upload.clone())
    }
}

#[async_trait]
impl UploadStore for InMemoryUploadStore {
    async fn create(&self, upload: NewUpload) -> DbResult<Upload> {
        let mut uploads = self.uploads.lock().await;
        if uploads.contains_key(&upload.id)
            || uploads.values().any(|u| u.temp_path == upload.temp_path)
        {
            return Err(DbError::Conflict(format!(
                "upload {} or temp path {} already registered",
                upload.id, upload.temp_path
            )));
        }

        let now = Utc::now();
        let created = Upload {
            id: upload.id,
            user_id: upload.user_id,
            original_filename: upload.original_filename,
            mime_type: upload.mime_type,
            size_bytes: upload.size_bytes,
            temp_path: upload.temp_path,
            status: UploadStatus::Queued,
            error: None,
            created_at: now,
            updated_at: now,
        };
        uploads.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> DbResult<Option<Upload>> {
        Ok(self.uploads.lock().await.get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> DbResult<Upload> {
        self.transition(id, UploadStatus::Processing, UploadStatus::can_claim, |u| {
            u.status = UploadStatus::Processing;
            u.error = None;
        })
        .await
    }

    async fn record_attempt_error(&self, id: Uuid, error: &str) -> DbResult<()> {
        self.transition(
            id,
            UploadStatus::Processing,
            |s| s == UploadStatus::Processing,
            |u| u.error = Some(error.to_string()),
        )
        .await
        .map(|_| ())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> DbResult<()> {
        self.transition(
            id,
            UploadStatus::Failed,
            |s| s != UploadStatus::Completed,
            |u| {
                u.status = UploadStatus::Failed;
                u.error = Some(error.to_string());
            },
        )
        .await
        .map(|_| ())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTrackStore {
    tracks: Arc<Mutex<HashMap<Uuid, Track>>>,
    uploads: InMemoryUploadStore,
}

impl InMemoryTrackStore {
    /// A track store with its own, empty upload table. `materialize` needs
    /// [`InMemoryTrackStore::linked`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A track store that completes uploads held by `uploads`.
    pub fn linked(uploads: &InMemoryUploadStore) -> Self {
        Self {
            tracks: Arc::default(),
            uploads: uploads.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.tracks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracks.lock().await.is_empty()
    }
}

#[async_trait]
impl TrackStore for InMemoryTrackStore {
    async fn create(&self, track: NewTrack) -> DbResult<Track> {
        track.check_ready().map_err(DbError::Invalid)?;

        let mut tracks = self.tracks.lock().await;
        if tracks.contains_key(&track.id) {
            return Err(DbError::AlreadyMaterialized(track.id));
        }
        let created = track.into_track(Utc::now());
        tracks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn materialize(&self, track: NewTrack, upload_id: Uuid) -> DbResult<Track> {
        track.check_ready().map_err(DbError::Invalid)?;

        // Both locks are held until both maps are updated.
        let mut tracks = self.tracks.lock().await;
        let mut uploads = self.uploads.uploads.lock().await;

        if tracks.contains_key(&track.id) {
            return Err(DbError::AlreadyMaterialized(track.id));
        }
        let upload = uploads
            .get_mut(&upload_id)
            .ok_or(DbError::NotFound(upload_id))?;
        if upload.status != UploadStatus::Processing {
            return Err(DbError::InvalidTransition {
                id: upload_id,
                from: upload.status,
                to: UploadStatus::Completed,
            });
        }

        let now = Utc::now();
        upload.status = UploadStatus::Completed;
        upload.error = None;
        upload.updated_at = now;

        let created = track.into_track(now);
        tracks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> DbResult<Option<Track>> {
        Ok(self.tracks.lock().await.get(&id).cloned())
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> DbResult<Vec<Track>> {
        let mut tracks: Vec<Track> = self
            .tracks
            .lock()
            .await
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        tracks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_upload(path: &str) -> NewUpload {
        NewUpload::new(Uuid::new_v4(), "song.mp3", "audio/mpeg", 1024, path)
    }

    fn new_track(id: Uuid) -> NewTrack {
        NewTrack {
            id,
            owner_id: Uuid::new_v4(),
            title: "Song".into(),
            artist: "Unknown Artist".into(),
            album: None,
            genre: None,
            duration_sec: 180.0,
            bpm: Some(120.0),
            loudness_lufs: -23.0,
            audio_128_key: "o/transcoded/u/audio_128.mp3".into(),
            audio_320_key: "o/transcoded/u/audio_320.mp3".into(),
            waveform_json_key: "o/transcoded/u/waveform.json".into(),
            cover_key: None,
            original_key: None,
        }
    }

    #[tokio::test]
    async fn upload_lifecycle_moves_forward() {
        let store = InMemoryUploadStore::new();
        let tracks = InMemoryTrackStore::linked(&store);
        let upload = store.create(new_upload("/tmp/a.mp3")).await.unwrap();
        assert_eq!(upload.status, UploadStatus::Queued);

        let claimed = store.mark_processing(upload.id).await.unwrap();
        assert_eq!(claimed.status, UploadStatus::Processing);

        tracks.materialize(new_track(upload.id), upload.id).await.unwrap();
        let done = store.get(upload.id).await.unwrap().unwrap();
        assert_eq!(done.status, UploadStatus::Completed);

        let err = store.mark_processing(upload.id).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { from: UploadStatus::Completed, .. }));
        let err = store.mark_failed(upload.id, "late").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn retry_keeps_processing_and_clears_error_on_reclaim() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(new_upload("/tmp/b.mp3")).await.unwrap();
        store.mark_processing(upload.id).await.unwrap();
        store.record_attempt_error(upload.id, "ffmpeg exited 1").await.unwrap();

        let pending = store.get(upload.id).await.unwrap().unwrap();
        assert_eq!(pending.status, UploadStatus::Processing);
        assert_eq!(pending.error.as_deref(), Some("ffmpeg exited 1"));

        let reclaimed = store.mark_processing(upload.id).await.unwrap();
        assert!(reclaimed.error.is_none());
    }

    #[tokio::test]
    async fn failed_upload_can_be_reclaimed_by_operator_retry() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(new_upload("/tmp/c.mp3")).await.unwrap();
        store.mark_failed(upload.id, "boom").await.unwrap();
        assert!(store.mark_processing(upload.id).await.is_ok());
    }

    #[tokio::test]
    async fn one_upload_per_temp_path() {
        let store = InMemoryUploadStore::new();
        store.create(new_upload("/tmp/same.mp3")).await.unwrap();
        let err = store.create(new_upload("/tmp/same.mp3")).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let store = InMemoryUploadStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.mark_processing(id).await.unwrap_err(),
            DbError::NotFound(got) if got == id
        ));
    }

    #[tokio::test]
    async fn duplicate_track_is_already_materialized() {
        let store = InMemoryTrackStore::new();
        let id = Uuid::new_v4();
        store.create(new_track(id)).await.unwrap();

        let err = store.create(new_track(id)).await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyMaterialized(got) if got == id));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn materialize_completes_upload_with_track() {
        let uploads = InMemoryUploadStore::new();
        let tracks = InMemoryTrackStore::linked(&uploads);
        let upload = uploads.create(new_upload("/tmp/m.mp3")).await.unwrap();
        uploads.mark_processing(upload.id).await.unwrap();
        uploads.record_attempt_error(upload.id, "earlier timeout").await.unwrap();

        let track = tracks.materialize(new_track(upload.id), upload.id).await.unwrap();
        assert_eq!(track.id, upload.id);

        let done = uploads.get(upload.id).await.unwrap().unwrap();
        assert_eq!(done.status, UploadStatus::Completed);
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn materialize_writes_nothing_when_upload_cannot_complete() {
        let uploads = InMemoryUploadStore::new();
        let tracks = InMemoryTrackStore::linked(&uploads);
        let upload = uploads.create(new_upload("/tmp/n.mp3")).await.unwrap();
        uploads.mark_failed(upload.id, "cancelled").await.unwrap();

        let err = tracks
            .materialize(new_track(upload.id), upload.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { from: UploadStatus::Failed, .. }));
        assert!(tracks.is_empty().await);
        assert_eq!(
            uploads.get(upload.id).await.unwrap().unwrap().status,
            UploadStatus::Failed
        );

        // an unlinked store knows no uploads at all
        let unlinked = InMemoryTrackStore::new();
        let err = unlinked
            .materialize(new_track(upload.id), upload.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        assert!(unlinked.is_empty().await);
    }

    #[tokio::test]
    async fn materialize_keeps_upload_processing_on_duplicate_track() {
        let uploads = InMemoryUploadStore::new();
        let tracks = InMemoryTrackStore::linked(&uploads);
        let upload = uploads.create(new_upload("/tmp/d.mp3")).await.unwrap();
        uploads.mark_processing(upload.id).await.unwrap();
        tracks.create(new_track(upload.id)).await.unwrap();

        let err = tracks
            .materialize(new_track(upload.id), upload.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyMaterialized(_)));
        assert_eq!(
            uploads.get(upload.id).await.unwrap().unwrap().status,
            UploadStatus::Processing
        );
    }

    #[tokio::test]
    async fn track_without_waveform_is_rejected() {
        let store = InMemoryTrackStore::new();
        let mut track = new_track(Uuid::new_v4());
        track.waveform_json_key.clear();
        assert!(matches!(store.create(track).await, Err(DbError::Invalid(_))));
        assert!(store.is_empty().await);
    }
}
