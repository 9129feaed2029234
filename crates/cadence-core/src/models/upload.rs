use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    /// A worker may claim an upload that is queued, being retried by the queue,
    /// or that an operator re-enqueued after failure. Completed is final.
    pub fn can_claim(self) -> bool {
        !matches!(self, UploadStatus::Completed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

impl Display for UploadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(UploadStatus::Queued),
            "processing" => Ok(UploadStatus::Processing),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid upload status: {}", s)),
        }
    }
}

/// One ingested raw file and its processing lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Upload {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub temp_path: String,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    /// Partition used for the original file key, e.g. `2024-03`.
    pub fn year_month(&self) -> String {
        self.created_at.format("%Y-%m").to_string()
    }
}

/// Input for creating an Upload in `Queued` state.
#[derive(Debug, Clone)]
pub struct NewUpload {
    /// Caller-supplied id; reused as job id and Track id.
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub temp_path: String,
}

impl NewUpload {
    pub fn new(
        user_id: Uuid,
        original_filename: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: i64,
        temp_path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            original_filename: original_filename.into(),
            mime_type: mime_type.into(),
            size_bytes,
            temp_path: temp_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn completed_uploads_cannot_be_reclaimed() {
        assert!(UploadStatus::Queued.can_claim());
        assert!(UploadStatus::Processing.can_claim());
        assert!(UploadStatus::Failed.can_claim());
        assert!(!UploadStatus::Completed.can_claim());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            UploadStatus::Queued,
            UploadStatus::Processing,
            UploadStatus::Completed,
            UploadStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<UploadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn year_month_partition() {
        let created = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let upload = Upload {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            original_filename: "song.mp3".into(),
            mime_type: "audio/mpeg".into(),
            size_bytes: 10,
            temp_path: "/tmp/x".into(),
            status: UploadStatus::Queued,
            error: None,
            created_at: created,
            updated_at: created,
        };
        assert_eq!(upload.year_month(), "2024-03");
    }
}
