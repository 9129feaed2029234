//! Job progress reporting
//!
//! The pipeline reports percentages through a [`ProgressReporter`]. The
//! reporter drops anything that would move progress backwards before it reaches
//! the backend's [`ProgressSink`], so observers only ever see non-decreasing
//! values.

use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Where a backend persists progress. Called synchronously from transcoder
/// callbacks, so implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn record(&self, job_id: Uuid, percent: u8);
}

struct DiscardSink;

impl ProgressSink for DiscardSink {
    fn record(&self, _job_id: Uuid, _percent: u8) {}
}

#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    current: Arc<Mutex<u8>>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(job_id: Uuid, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            job_id,
            current: Arc::new(Mutex::new(0)),
            sink,
        }
    }

    /// Reporter that tracks progress without persisting it.
    pub fn discard(job_id: Uuid) -> Self {
        Self::new(job_id, Arc::new(DiscardSink))
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn current(&self) -> u8 {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report `percent` (capped at 100). Values not above the last report are ignored.
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if percent > *current {
            *current = percent;
            // recorded under the lock so the sink sees values in order
            self.sink.record(self.job_id, percent);
        }
    }

    /// Map a stage-local fraction in [0, 1] onto the `start..=end` percentage band.
    pub fn report_within(&self, start: u8, end: u8, fraction: f64) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let (start, end) = (start.min(end), end.max(start));
        let percent = f64::from(start) + f64::from(end - start) * fraction;
        self.report(percent.floor() as u8);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("current", &self.current())
            .finish()
    }
}
