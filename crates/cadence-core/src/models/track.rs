use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Processing,
    Ready,
    Failed,
}

impl Display for TrackStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TrackStatus::Processing => write!(f, "processing"),
            TrackStatus::Ready => write!(f, "ready"),
            TrackStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Playable result of a successful transcode. `id` always equals the
/// originating upload id, so at most one Track exists per Upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Track {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub duration_sec: f64,
    pub bpm: Option<f64>,
    pub loudness_lufs: f64,
    pub status: TrackStatus,
    pub audio_128_key: String,
    pub audio_320_key: String,
    pub waveform_json_key: String,
    pub cover_key: Option<String>,
    pub original_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload. Tracks are only ever created in `Ready` state.
#[derive(Debug, Clone)]
pub struct NewTrack {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub duration_sec: f64,
    pub bpm: Option<f64>,
    pub loudness_lufs: f64,
    pub audio_128_key: String,
    pub audio_320_key: String,
    pub waveform_json_key: String,
    pub cover_key: Option<String>,
    pub original_key: Option<String>,
}

impl NewTrack {
    /// A Ready track must reference both bitrates and the waveform.
    pub fn check_ready(&self) -> Result<(), String> {
        let required = [
            ("audio_128_key", &self.audio_128_key),
            ("audio_320_key", &self.audio_320_key),
            ("waveform_json_key", &self.waveform_json_key),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty for a ready track", field));
            }
        }
        if !self.duration_sec.is_finite() || self.duration_sec < 0.0 {
            return Err(format!("invalid duration {}", self.duration_sec));
        }
        Ok(())
    }

    pub fn into_track(self, now: DateTime<Utc>) -> Track {
        Track {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            artist: self.artist,
            album: self.album,
            genre: self.genre,
            duration_sec: self.duration_sec,
            bpm: self.bpm,
            loudness_lufs: self.loudness_lufs,
            status: TrackStatus::Ready,
            audio_128_key: self.audio_128_key,
            audio_320_key: self.audio_320_key,
            waveform_json_key: self.waveform_json_key,
            cover_key: self.cover_key,
            original_key: self.original_key,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_track() -> NewTrack {
        NewTrack {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            title: "Song".into(),
            artist: "Artist".into(),
            album: None,
            genre: None,
            duration_sec: 180.0,
            bpm: None,
            loudness_lufs: -14.2,
            audio_128_key: "u/transcoded/t/audio_128.mp3".into(),
            audio_320_key: "u/transcoded/t/audio_320.mp3".into(),
            waveform_json_key: "u/transcoded/t/waveform.json".into(),
            cover_key: None,
            original_key: None,
        }
    }

    #[test]
    fn ready_track_requires_all_artifact_keys() {
        assert!(new_track().check_ready().is_ok());

        let mut missing = new_track();
        missing.audio_320_key = String::new();
        let err = missing.check_ready().unwrap_err();
        assert!(err.contains("audio_320_key"));
    }

    #[test]
    fn into_track_is_ready() {
        let track = new_track().into_track(Utc::now());
        assert_eq!(track.status, TrackStatus::Ready);
    }
}
