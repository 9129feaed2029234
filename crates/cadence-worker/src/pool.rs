//! Bounded worker pool shared by both queue backends.
//!
//! The pool does not pull jobs itself. A backend acquires a permit, then hands
//! the claimed job to [`WorkerPool::run`] on a spawned task that holds the
//! permit until the attempt finishes.

use cadence_core::models::TranscodeJob;
use cadence_core::JobError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::context::{JobContext, JobHandler};

#[derive(Clone)]
pub struct WorkerPool {
    handler: Arc<dyn JobHandler>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    job_timeout: Duration,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn JobHandler>, concurrency: usize, job_timeout: Duration) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            handler,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            job_timeout,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of idle slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot. `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Run one attempt under the job timeout. A timeout is recoverable.
    #[tracing::instrument(
        skip(self, job, ctx),
        fields(job_id = %job.id(), attempt = ctx.attempt, max_attempts = ctx.max_attempts)
    )]
    pub async fn run(&self, job: &TranscodeJob, ctx: &JobContext) -> Result<(), JobError> {
        let start = Instant::now();
        tracing::info!("Job attempt started");

        let result = match tokio::time::timeout(self.job_timeout, self.handler.handle(job, ctx)).await
        {
            Ok(result) => result,
            Err(_) => {
                let err = JobError::recoverable(anyhow::anyhow!(
                    "Job timed out after {}s",
                    self.job_timeout.as_secs()
                ));
                tracing::error!(
                    timeout_secs = self.job_timeout.as_secs(),
                    "Job execution timed out"
                );
                self.handler.abandoned(job, ctx, &err).await;
                Err(err)
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => tracing::info!(duration_ms, "Job attempt succeeded"),
            Err(e) => tracing::warn!(
                duration_ms,
                error = %e,
                recoverable = e.is_recoverable(),
                "Job attempt failed"
            ),
        }
        result
    }

    /// Wait until every slot is idle, up to `grace`. Returns false on timeout.
    pub async fn drain(&self, grace: Duration) -> bool {
        let all = self.concurrency as u32;
        match tokio::time::timeout(grace, self.semaphore.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }
}
