//! Job queue abstraction
//!
//! Two backends sit behind [`JobQueue`]:
//!
//! - [`RedisQueue`] (durable): at-least-once delivery, bounded retries with
//!   exponential backoff, bounded history.
//! - [`LocalQueue`] (degraded): bounded in-process channel feeding the same
//!   [`WorkerPool`], one attempt per job, state lost on restart.
//!
//! [`connect_queue`] probes the broker once at start-up and the choice holds
//! for the life of the process. Callers must not branch on [`JobQueue::mode`]
//! outside of health reporting.

mod local;
mod redis;

use async_trait::async_trait;
use cadence_core::models::{JobHandle, JobStatus, QueueMode, TranscodeJob};
use cadence_core::QueueConfig;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::pool::WorkerPool;

pub use self::local::LocalQueue;
pub use self::redis::RedisQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Local queue is full ({0} jobs pending)")]
    Full(usize),

    #[error("Queue is shut down")]
    Closed,

    #[error("Broker did not answer within {0}ms")]
    ProbeTimeout(u64),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// `durable` or `degraded`; for health reporting only.
    fn mode(&self) -> QueueMode;

    /// Submit a job. Enqueueing an id that is still pending returns the existing handle.
    async fn enqueue(&self, job: TranscodeJob) -> Result<JobHandle, QueueError>;

    /// `None` for unknown ids and for history that has been pruned.
    async fn status(&self, id: Uuid) -> Result<Option<JobStatus>, QueueError>;

    /// Re-enqueue every job on the failed list as a fresh job. Returns how many.
    async fn retry_failed(&self) -> Result<usize, QueueError>;

    /// Drop the failed list and its job records. Returns how many.
    async fn clear_failed(&self) -> Result<usize, QueueError>;

    /// Stop claiming new jobs. In-flight attempts keep running.
    async fn shutdown(&self);
}

/// Pick the backend for this process.
///
/// The broker is used when `REDIS_URL` is set, the broker is not disabled, and
/// a connect plus `PING` succeeds within the probe timeout. Otherwise the
/// degraded in-process queue is returned; that never fails.
///
/// `consume` starts the durable consumer loop on `pool`. The degraded queue
/// always consumes, since nothing else could run its jobs.
pub async fn connect_queue(
    config: &QueueConfig,
    pool: WorkerPool,
    consume: bool,
) -> Arc<dyn JobQueue> {
    let Some(url) = config.redis_url.as_deref().filter(|_| !config.disable_broker) else {
        tracing::warn!(
            disable_broker = config.disable_broker,
            "No queue broker configured, running in degraded mode"
        );
        return LocalQueue::start(config, pool);
    };

    match RedisQueue::connect(url, config).await {
        Ok(queue) => {
            let queue = Arc::new(queue);
            if consume {
                queue.start(pool);
            }
            tracing::info!(consume, "Queue broker reachable, running in durable mode");
            queue
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                probe_timeout_ms = config.probe_timeout_ms,
                "Queue broker unreachable, running in degraded mode"
            );
            LocalQueue::start(config, pool)
        }
    }
}

/// `base * 2^(attempt - 1)` seconds, capped.
pub(crate) fn backoff_secs(base_secs: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(32);
    base_secs
        .saturating_mul(2_u64.saturating_pow(exponent))
        .min(MAX_BACKOFF_SECS)
}

/// Upper bound for a single retry delay.
pub const MAX_BACKOFF_SECS: u64 = 300;
