//! Job handler trait
//!
//! Queue backends own delivery and retry policy; they call `JobHandler::handle`
//! once per attempt and read only the recoverable flag of the returned
//! [`JobError`].

use async_trait::async_trait;
use cadence_core::models::TranscodeJob;
use cadence_core::JobError;

use crate::progress::ProgressReporter;

/// Per-attempt information handed to the handler.
#[derive(Clone)]
pub struct JobContext {
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress: ProgressReporter,
}

impl JobContext {
    pub fn new(attempt: u32, max_attempts: u32, progress: ProgressReporter) -> Self {
        Self {
            attempt,
            max_attempts: max_attempts.max(1),
            progress,
        }
    }

    /// No retry follows a failure of this attempt, whatever the error.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &TranscodeJob, ctx: &JobContext) -> Result<(), JobError>;

    /// Called when an attempt was cut short (timeout) and `handle` never returned.
    async fn abandoned(&self, _job: &TranscodeJob, _ctx: &JobContext, _error: &JobError) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn last_attempt_detection() {
        let progress = ProgressReporter::discard(Uuid::new_v4());
        assert!(!JobContext::new(1, 3, progress.clone()).is_last_attempt());
        assert!(JobContext::new(3, 3, progress.clone()).is_last_attempt());
        // a zero budget still allows the single attempt being run
        assert!(JobContext::new(1, 0, progress).is_last_attempt());
    }
}
