//! Durable queue on Redis.
//!
//! Layout under `cadence:transcode:`
//!
//! | key | type | content |
//! |---|---|---|
//! | `wait` | list | ids ready to run, claimed from the left |
//! | `active` | list | ids claimed by a worker |
//! | `delayed` | zset | ids waiting for a retry, scored by due time (ms) |
//! | `completed`, `failed` | list | most recent first, trimmed to the retention bounds |
//! | `job:{id}` | hash | `data`, `state`, `progress`, `attempts`, `failed_reason`, timestamps |
//!
//! Claims move an id from `wait` to `active` with `LMOVE`, so a crash leaves it
//! in `active`; the consumer moves such ids back to `wait` when it starts. This
//! assumes one consuming worker process per broker.

use async_trait::async_trait;
use cadence_core::models::{JobHandle, JobState, JobStatus, QueueMode, TranscodeJob};
use cadence_core::{JobError, QueueConfig};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Pipeline, Script};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{backoff_secs, JobQueue, QueueError};
use crate::context::JobContext;
use crate::pool::WorkerPool;
use crate::progress::{ProgressReporter, ProgressSink};

const KEY_PREFIX: &str = "cadence:transcode";

/// Finished job records expire after this long even if still listed.
const COMPLETED_TTL_SECS: i64 = 24 * 60 * 60;
const FAILED_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Only ever raises the stored progress, and never recreates a deleted record.
const RAISE_PROGRESS_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local current = tonumber(redis.call('HGET', KEYS[1], 'progress')) or 0
if tonumber(ARGV[1]) > current then
  redis.call('HSET', KEYS[1], 'progress', ARGV[1])
  return 1
end
return 0
";

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
    wait: String,
    active: String,
    delayed: String,
    completed: String,
    failed: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            wait: format!("{}:wait", prefix),
            active: format!("{}:active", prefix),
            delayed: format!("{}:delayed", prefix),
            completed: format!("{}:completed", prefix),
            failed: format!("{}:failed", prefix),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Keep the newest `retain` entries of a history list (0 keeps none).
fn trim_history(pipe: &mut Pipeline, key: &str, retain: usize) {
    if retain == 0 {
        pipe.cmd("DEL").arg(key).ignore();
    } else {
        let stop = isize::try_from(retain - 1).unwrap_or(isize::MAX);
        pipe.cmd("LTRIM").arg(key).arg(0).arg(stop).ignore();
    }
}

struct ClaimedJob {
    job: TranscodeJob,
    attempt: u32,
}

struct RedisProgress {
    tx: mpsc::UnboundedSender<(Uuid, u8)>,
}

impl ProgressSink for RedisProgress {
    fn record(&self, job_id: Uuid, percent: u8) {
        let _ = self.tx.send((job_id, percent));
    }
}

pub struct RedisQueue {
    conn: MultiplexedConnection,
    keys: Keys,
    config: QueueConfig,
    raise_progress: Script,
    shutdown: watch::Sender<bool>,
}

impl RedisQueue {
    /// Connect and `PING` within the probe timeout.
    pub async fn connect(url: &str, config: &QueueConfig) -> Result<Self, QueueError> {
        let probe = async {
            let client = Client::open(url)?;
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, QueueError>(conn)
        };

        let conn = tokio::time::timeout(config.probe_timeout(), probe)
            .await
            .map_err(|_| QueueError::ProbeTimeout(config.probe_timeout_ms))??;

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            conn,
            keys: Keys::new(KEY_PREFIX),
            config: config.clone(),
            raise_progress: Script::new(RAISE_PROGRESS_LUA),
            shutdown,
        })
    }

    /// Spawn the consumer loop: recover stalled jobs, then poll for due and waiting jobs.
    pub fn start(self: &Arc<Self>, pool: WorkerPool) {
        let queue = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            match queue.recover_stalled().await {
                Ok(0) => {}
                Ok(recovered) => {
                    tracing::warn!(recovered, "Re-queued jobs left active by a previous worker")
                }
                Err(e) => tracing::error!(error = %e, "Failed to recover stalled jobs"),
            }

            let (progress_tx, progress_rx) = mpsc::unbounded_channel();
            tokio::spawn(Arc::clone(&queue).write_progress(progress_rx));
            let sink: Arc<dyn ProgressSink> = Arc::new(RedisProgress { tx: progress_tx });

            tracing::info!(
                concurrency = pool.concurrency(),
                poll_interval_ms = queue.config.poll_interval_ms,
                max_attempts = queue.config.max_attempts,
                "Durable queue consumer started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(queue.config.poll_interval()) => {
                        if let Err(e) = queue.tick(&pool, &sink).await {
                            tracing::error!(error = %e, "Queue poll failed");
                        }
                    }
                }
            }

            tracing::info!("Durable queue consumer stopped");
        });
    }

    async fn tick(
        self: &Arc<Self>,
        pool: &WorkerPool,
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<(), QueueError> {
        self.promote_delayed().await?;

        while let Some(permit) = pool.try_acquire() {
            let Some(claimed) = self.claim_next().await? else {
                break;
            };

            let queue = Arc::clone(self);
            let pool = pool.clone();
            let sink = Arc::clone(sink);
            tokio::spawn(async move {
                let _permit = permit;
                queue.process(claimed, &pool, sink).await;
            });
        }

        Ok(())
    }

    async fn process(&self, claimed: ClaimedJob, pool: &WorkerPool, sink: Arc<dyn ProgressSink>) {
        let id = claimed.job.id();
        let ctx = JobContext::new(
            claimed.attempt,
            self.config.max_attempts,
            ProgressReporter::new(id, sink),
        );

        let settled = match pool.run(&claimed.job, &ctx).await {
            Ok(()) => self.complete(id).await,
            Err(e) => self.fail(id, claimed.attempt, &e).await,
        };

        if let Err(e) = settled {
            tracing::error!(
                job_id = %id,
                error = %e,
                "Failed to record job outcome, job stays active until the next consumer start"
            );
        }
    }

    async fn write_progress(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(Uuid, u8)>) {
        while let Some((id, percent)) = rx.recv().await {
            let mut conn = self.conn.clone();
            let result: Result<i64, redis::RedisError> = self
                .raise_progress
                .key(self.keys.job(&id.to_string()))
                .arg(percent)
                .invoke_async(&mut conn)
                .await;
            if let Err(e) = result {
                tracing::debug!(job_id = %id, percent, error = %e, "Progress write failed");
            }
        }
    }

    /// Move ids left in `active` back to the front of `wait`.
    async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let id: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.active)
                .arg(&self.keys.wait)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            let Some(id) = id else {
                break;
            };
            let _: () = conn
                .hset(self.keys.job(&id), "state", JobState::Waiting.as_str())
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Move due retries from `delayed` to `wait`.
    async fn promote_delayed(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(&self.keys.delayed, "-inf", now_ms())
            .await?;

        for id in due {
            let removed: i64 = conn.zrem(&self.keys.delayed, &id).await?;
            if removed == 0 {
                continue;
            }
            let _: () = redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(&self.keys.wait)
                .arg(&id)
                .ignore()
                .cmd("HSET")
                .arg(self.keys.job(&id))
                .arg("state")
                .arg(JobState::Waiting.as_str())
                .ignore()
                .query_async(&mut conn)
                .await?;
            tracing::debug!(job_id = %id, "Retry due, job moved to wait");
        }
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("LMOVE")
            .arg(&self.keys.wait)
            .arg(&self.keys.active)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let job_key = self.keys.job(&id);
        let data: Option<String> = conn.hget(&job_key, "data").await?;
        let parsed = match data {
            Some(data) => serde_json::from_str::<TranscodeJob>(&data).map_err(|e| e.to_string()),
            None => Err("job record missing".to_string()),
        };
        let job = match parsed {
            Ok(job) => job,
            Err(reason) => {
                let _: i64 = conn.lrem(&self.keys.active, 0, &id).await?;
                return Err(QueueError::Corrupt { id, reason });
            }
        };

        let (attempt,): (u32,) = redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&job_key)
            .arg("attempts")
            .arg(1)
            .cmd("HSET")
            .arg(&job_key)
            .arg("state")
            .arg(JobState::Active.as_str())
            .arg("processed_at")
            .arg(now_ms())
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(job_id = %id, attempt, "Job claimed");
        Ok(Some(ClaimedJob { job, attempt }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let id = id.to_string();
        let job_key = self.keys.job(&id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.keys.active)
            .arg(0)
            .arg(&id)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.keys.completed)
            .arg(&id)
            .ignore();
        trim_history(&mut pipe, &self.keys.completed, self.config.retain_completed);
        pipe.cmd("HSET")
            .arg(&job_key)
            .arg("state")
            .arg(JobState::Completed.as_str())
            .arg("progress")
            .arg(100)
            .arg("finished_at")
            .arg(now_ms())
            .ignore()
            .cmd("HDEL")
            .arg(&job_key)
            .arg("failed_reason")
            .ignore()
            .cmd("EXPIRE")
            .arg(&job_key)
            .arg(COMPLETED_TTL_SECS)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        tracing::info!(job_id = %id, "Job completed");
        Ok(())
    }

    async fn fail(&self, id: Uuid, attempt: u32, err: &JobError) -> Result<(), QueueError> {
        let reason = err.to_string();
        let retry = err.is_recoverable() && attempt < self.config.max_attempts;
        let id = id.to_string();
        let job_key = self.keys.job(&id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.keys.active)
            .arg(0)
            .arg(&id)
            .ignore();

        if retry {
            let delay = backoff_secs(self.config.backoff_base_secs, attempt);
            let due = now_ms() + (delay as i64) * 1000;
            pipe.cmd("ZADD")
                .arg(&self.keys.delayed)
                .arg(due)
                .arg(&id)
                .ignore()
                .cmd("HSET")
                .arg(&job_key)
                .arg("state")
                .arg(JobState::Delayed.as_str())
                .arg("failed_reason")
                .arg(&reason)
                .ignore();
            tracing::info!(
                job_id = %id,
                attempt,
                max_attempts = self.config.max_attempts,
                backoff_secs = delay,
                "Scheduling job retry"
            );
        } else {
            pipe.cmd("LPUSH").arg(&self.keys.failed).arg(&id).ignore();
            trim_history(&mut pipe, &self.keys.failed, self.config.retain_failed);
            pipe.cmd("HSET")
                .arg(&job_key)
                .arg("state")
                .arg(JobState::Failed.as_str())
                .arg("failed_reason")
                .arg(&reason)
                .arg("finished_at")
                .arg(now_ms())
                .ignore()
                .cmd("EXPIRE")
                .arg(&job_key)
                .arg(FAILED_TTL_SECS)
                .ignore();
            tracing::error!(
                job_id = %id,
                attempt,
                recoverable = err.is_recoverable(),
                error = %reason,
                "Job failed permanently"
            );
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

fn parse_status(id: Uuid, fields: &HashMap<String, String>) -> Result<JobStatus, QueueError> {
    let corrupt = |reason: String| QueueError::Corrupt {
        id: id.to_string(),
        reason,
    };

    let state = fields
        .get("state")
        .ok_or_else(|| corrupt("missing state".to_string()))?
        .parse::<JobState>()
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(JobStatus {
        id,
        state,
        progress: fields
            .get("progress")
            .and_then(|p| p.parse::<u8>().ok())
            .unwrap_or(0)
            .min(100),
        attempts_made: fields
            .get("attempts")
            .and_then(|a| a.parse().ok())
            .unwrap_or(0),
        failure_reason: fields.get("failed_reason").cloned(),
    })
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn mode(&self) -> QueueMode {
        QueueMode::Durable
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id()))]
    async fn enqueue(&self, job: TranscodeJob) -> Result<JobHandle, QueueError> {
        let id = job.id();
        let id_str = id.to_string();
        let job_key = self.keys.job(&id_str);
        let mut conn = self.conn.clone();

        let existing: Option<String> = conn.hget(&job_key, "state").await?;
        if let Some(state) = existing.and_then(|s| s.parse::<JobState>().ok()) {
            if !state.is_finished() {
                tracing::debug!(state = %state, "Job already pending");
                return Ok(JobHandle { id });
            }
        }

        let data = serde_json::to_string(&job)?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&job_key)
            .ignore()
            .cmd("HSET")
            .arg(&job_key)
            .arg("data")
            .arg(&data)
            .arg("state")
            .arg(JobState::Waiting.as_str())
            .arg("progress")
            .arg(0)
            .arg("attempts")
            .arg(0)
            .arg("created_at")
            .arg(now_ms())
            .ignore()
            .cmd("LREM")
            .arg(&self.keys.completed)
            .arg(0)
            .arg(&id_str)
            .ignore()
            .cmd("LREM")
            .arg(&self.keys.failed)
            .arg(0)
            .arg(&id_str)
            .ignore()
            .cmd("RPUSH")
            .arg(&self.keys.wait)
            .arg(&id_str)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::info!(upload_id = %job.upload_id, "Job queued on broker");
        Ok(JobHandle { id })
    }

    async fn status(&self, id: Uuid) -> Result<Option<JobStatus>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.job(&id.to_string())).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_status(id, &fields).map(Some)
    }

    async fn retry_failed(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(&self.keys.failed, 0, -1).await?;

        let mut retried = 0;
        for id in ids {
            let job_key = self.keys.job(&id);
            let exists: bool = conn.exists(&job_key).await?;

            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("LREM")
                .arg(&self.keys.failed)
                .arg(0)
                .arg(&id)
                .ignore();
            if exists {
                pipe.cmd("HSET")
                    .arg(&job_key)
                    .arg("state")
                    .arg(JobState::Waiting.as_str())
                    .arg("progress")
                    .arg(0)
                    .arg("attempts")
                    .arg(0)
                    .ignore()
                    .cmd("HDEL")
                    .arg(&job_key)
                    .arg("failed_reason")
                    .arg("finished_at")
                    .ignore()
                    .cmd("PERSIST")
                    .arg(&job_key)
                    .ignore()
                    .cmd("RPUSH")
                    .arg(&self.keys.wait)
                    .arg(&id)
                    .ignore();
                retried += 1;
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }

        tracing::info!(retried, "Re-queued failed jobs");
        Ok(retried)
    }

    async fn clear_failed(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(&self.keys.failed, 0, -1).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.cmd("DEL").arg(self.keys.job(id)).ignore();
        }
        pipe.cmd("DEL").arg(&self.keys.failed).ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::info!(cleared = ids.len(), "Cleared failed jobs");
        Ok(ids.len())
    }

    async fn shutdown(&self) {
        tracing::info!("Shutting down durable queue consumer");
        let _ = self.shutdown.send(true);
    }
}
