use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Queue payload for one transcode. The job id is the upload id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscodeJob {
    pub upload_id: Uuid,
    pub user_id: Uuid,
    pub temp_path: String,
    pub temp_file_name: String,
    /// `YYYY-MM` partition for the original file key.
    pub year_month: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl TranscodeJob {
    pub fn id(&self) -> Uuid {
        self.upload_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    /// Waiting for a retry backoff to elapse.
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(anyhow::anyhow!("Invalid job state: {}", s)),
        }
    }
}

/// Snapshot returned by `JobQueue::status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: Uuid,
    pub state: JobState,
    /// 0-100
    pub progress: u8,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Returned by `JobQueue::enqueue`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Broker-backed, retries with backoff.
    Durable,
    /// In-process, single attempt, lost on restart.
    Degraded,
}

impl QueueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueMode::Durable => "durable",
            QueueMode::Degraded => "degraded",
        }
    }
}

impl Display for QueueMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_payload_json_omits_missing_request_id() {
        let job = TranscodeJob {
            upload_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            temp_path: "/tmp/cadence/incoming/a.mp3".into(),
            temp_file_name: "a.mp3".into(),
            year_month: "2024-03".into(),
            request_id: None,
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(!json.contains("request_id"));
        let back: TranscodeJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.id(), job.upload_id);
    }

    #[test]
    fn finished_states() {
        assert!(JobState::Completed.is_finished());
        assert!(JobState::Failed.is_finished());
        assert!(!JobState::Delayed.is_finished());
        assert_eq!("delayed".parse::<JobState>().unwrap(), JobState::Delayed);
    }

    #[test]
    fn queue_mode_strings() {
        assert_eq!(QueueMode::Durable.as_str(), "durable");
        assert_eq!(QueueMode::Degraded.to_string(), "degraded");
    }
}
