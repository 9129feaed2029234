//! Artifact publishing
//!
//! Writes every derived artifact of one upload to storage under
//! `{owner}/transcoded/{upload}/` plus the raw input under
//! `{owner}/originals/{YYYY-MM}/{upload}/`. The caller creates the Track only
//! after `publish` returns, so a failure here leaves at most unreferenced
//! objects behind.

use cadence_core::constants::{
    ARTIFACT_AUDIO_128, ARTIFACT_AUDIO_320, ARTIFACT_COVER, ARTIFACT_WAVEFORM, CONTENT_TYPE_JPEG,
    CONTENT_TYPE_JSON, CONTENT_TYPE_MPEG,
};
use cadence_core::PipelineError;
use cadence_storage::{keys, Storage};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Everything produced for one upload, ready to be stored.
pub struct ArtifactSet<'a> {
    pub owner_id: Uuid,
    pub upload_id: Uuid,
    pub year_month: &'a str,
    pub original_path: &'a Path,
    pub original_file_name: &'a str,
    pub original_mime_type: &'a str,
    pub audio_128_path: &'a Path,
    pub audio_320_path: &'a Path,
    pub waveform_json: Vec<u8>,
    /// JPEG bytes
    pub cover: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedArtifacts {
    pub audio_128_key: String,
    pub audio_320_key: String,
    pub waveform_json_key: String,
    pub cover_key: Option<String>,
    pub original_key: String,
}

#[derive(Clone)]
pub struct ArtifactPublisher {
    storage: Arc<dyn Storage>,
}

impl ArtifactPublisher {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Store all artifacts. Any failed write fails the whole call.
    #[tracing::instrument(skip(self, set), fields(upload_id = %set.upload_id, owner_id = %set.owner_id))]
    pub async fn publish(&self, set: ArtifactSet<'_>) -> Result<PublishedArtifacts, PipelineError> {
        let start = Instant::now();
        let key = |artifact: &str| keys::transcoded_key(set.owner_id, set.upload_id, artifact);

        let audio_128_key = key(ARTIFACT_AUDIO_128);
        self.storage
            .put_file(&audio_128_key, set.audio_128_path, CONTENT_TYPE_MPEG)
            .await?;

        let audio_320_key = key(ARTIFACT_AUDIO_320);
        self.storage
            .put_file(&audio_320_key, set.audio_320_path, CONTENT_TYPE_MPEG)
            .await?;

        let waveform_json_key = key(ARTIFACT_WAVEFORM);
        self.storage
            .put(&waveform_json_key, set.waveform_json, CONTENT_TYPE_JSON)
            .await?;

        let cover_key = match set.cover {
            Some(cover) => {
                let cover_key = key(ARTIFACT_COVER);
                self.storage.put(&cover_key, cover, CONTENT_TYPE_JPEG).await?;
                Some(cover_key)
            }
            None => None,
        };

        let original_key = keys::original_key(
            set.owner_id,
            set.year_month,
            set.upload_id,
            set.original_file_name,
        );
        self.storage
            .put_file(&original_key, set.original_path, set.original_mime_type)
            .await?;

        tracing::info!(
            artifacts = if cover_key.is_some() { 5 } else { 4 },
            duration_ms = start.elapsed().as_millis() as u64,
            "Artifacts published"
        );

        Ok(PublishedArtifacts {
            audio_128_key,
            audio_320_key,
            waveform_json_key,
            cover_key,
            original_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_storage::LocalStorage;

    async fn fixture() -> (tempfile::TempDir, ArtifactPublisher) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("media"), "http://localhost/media".into())
            .await
            .unwrap();
        (dir, ArtifactPublisher::new(Arc::new(storage)))
    }

    #[tokio::test]
    async fn publishes_under_deterministic_keys() {
        let (dir, publisher) = fixture().await;
        let input = dir.path().join("input.mp3");
        let low = dir.path().join("audio_128.mp3");
        let high = dir.path().join("audio_320.mp3");
        for (path, bytes) in [(&input, b"raw".as_slice()), (&low, b"low"), (&high, b"high")] {
            tokio::fs::write(path, bytes).await.unwrap();
        }
        let owner = Uuid::new_v4();
        let upload = Uuid::new_v4();

        let published = publisher
            .publish(ArtifactSet {
                owner_id: owner,
                upload_id: upload,
                year_month: "2024-03",
                original_path: &input,
                original_file_name: "My Song.mp3",
                original_mime_type: "audio/mpeg",
                audio_128_path: &low,
                audio_320_path: &high,
                waveform_json: br#"{"peaks":[],"duration":0,"sampleRate":44100}"#.to_vec(),
                cover: None,
            })
            .await
            .unwrap();

        let prefix = format!("{}/transcoded/{}/", owner, upload);
        assert_eq!(published.audio_128_key, format!("{}audio_128.mp3", prefix));
        assert_eq!(published.audio_320_key, format!("{}audio_320.mp3", prefix));
        assert_eq!(published.waveform_json_key, format!("{}waveform.json", prefix));
        assert!(published.cover_key.is_none());
        assert_eq!(
            published.original_key,
            format!("{}/originals/2024-03/{}/My Song.mp3", owner, upload)
        );

        let storage = publisher.storage();
        assert_eq!(storage.get(&published.audio_320_key).await.unwrap(), b"high");
        let head = storage.head(&published.waveform_json_key).await.unwrap().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("application/json"));
        assert_eq!(storage.list(&prefix).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_output_fails_publish() {
        let (dir, publisher) = fixture().await;
        let input = dir.path().join("input.mp3");
        tokio::fs::write(&input, b"raw").await.unwrap();

        let err = publisher
            .publish(ArtifactSet {
                owner_id: Uuid::new_v4(),
                upload_id: Uuid::new_v4(),
                year_month: "2024-03",
                original_path: &input,
                original_file_name: "a.mp3",
                original_mime_type: "audio/mpeg",
                audio_128_path: &dir.path().join("missing_128.mp3"),
                audio_320_path: &dir.path().join("missing_320.mp3"),
                waveform_json: Vec::new(),
                cover: Some(vec![0xFF, 0xD8, 0xFF]),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Storage(_)));
    }
}
