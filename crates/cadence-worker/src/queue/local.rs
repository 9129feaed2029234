//! In-process queue used when no broker is reachable.
//!
//! Jobs go through a bounded channel to a dispatcher task that runs them on the
//! shared [`WorkerPool`], so degraded mode really executes the pipeline. There
//! is a single attempt per job and all state is lost on restart.

use async_trait::async_trait;
use cadence_core::models::{JobHandle, JobState, JobStatus, QueueMode, TranscodeJob};
use cadence_core::QueueConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{JobQueue, QueueError};
use crate::context::JobContext;
use crate::pool::WorkerPool;
use crate::progress::{ProgressReporter, ProgressSink};

struct LocalJob {
    state: JobState,
    progress: u8,
    attempts: u32,
    failure_reason: Option<String>,
}

/// Job table with bounded finished history.
struct LocalState {
    jobs: HashMap<Uuid, LocalJob>,
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
    retain_completed: usize,
    retain_failed: usize,
}

impl LocalState {
    fn new(retain_completed: usize, retain_failed: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            retain_completed,
            retain_failed,
        }
    }

    fn insert_waiting(&mut self, id: Uuid) {
        self.completed.retain(|x| *x != id);
        self.failed.retain(|x| *x != id);
        self.jobs.insert(
            id,
            LocalJob {
                state: JobState::Waiting,
                progress: 0,
                attempts: 0,
                failure_reason: None,
            },
        );
    }

    fn mark_active(&mut self, id: Uuid) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Active;
            job.attempts += 1;
        }
    }

    fn finish(&mut self, id: Uuid, failure: Option<String>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };

        let (history, retain, state) = match failure {
            None => {
                job.progress = 100;
                (&mut self.completed, self.retain_completed, JobState::Completed)
            }
            Some(reason) => {
                job.failure_reason = Some(reason);
                (&mut self.failed, self.retain_failed, JobState::Failed)
            }
        };
        job.state = state;

        history.retain(|x| *x != id);
        history.push_back(id);
        while history.len() > retain {
            let Some(evicted) = history.pop_front() else {
                break;
            };
            if self
                .jobs
                .get(&evicted)
                .is_some_and(|job| job.state.is_finished())
            {
                self.jobs.remove(&evicted);
            }
        }
    }
}

fn lock(state: &Mutex<LocalState>) -> MutexGuard<'_, LocalState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LocalProgress {
    state: Arc<Mutex<LocalState>>,
}

impl ProgressSink for LocalProgress {
    fn record(&self, job_id: Uuid, percent: u8) {
        if let Some(job) = lock(&self.state).jobs.get_mut(&job_id) {
            job.progress = job.progress.max(percent);
        }
    }
}

pub struct LocalQueue {
    tx: mpsc::Sender<TranscodeJob>,
    state: Arc<Mutex<LocalState>>,
    capacity: usize,
    shutdown: watch::Sender<bool>,
}

impl LocalQueue {
    /// Create the queue and spawn its dispatcher on `pool`.
    pub fn start(config: &QueueConfig, pool: WorkerPool) -> Arc<Self> {
        let capacity = config.local_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(LocalState::new(
            config.retain_completed,
            config.retain_failed,
        )));

        tokio::spawn(Self::dispatch(rx, state.clone(), pool, shutdown_rx));

        tracing::info!(capacity, "Local job queue started");

        Arc::new(Self {
            tx,
            state,
            capacity,
            shutdown,
        })
    }

    async fn dispatch(
        mut rx: mpsc::Receiver<TranscodeJob>,
        state: Arc<Mutex<LocalState>>,
        pool: WorkerPool,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let job = tokio::select! {
                _ = shutdown_rx.changed() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let Some(permit) = pool.acquire().await else {
                break;
            };

            let state = state.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                let _permit = permit;
                Self::run_one(job, state, pool).await;
            });
        }

        tracing::info!("Local job queue dispatcher stopped");
    }

    async fn run_one(job: TranscodeJob, state: Arc<Mutex<LocalState>>, pool: WorkerPool) {
        let id = job.id();
        lock(&state).mark_active(id);

        let sink = Arc::new(LocalProgress {
            state: state.clone(),
        });
        let ctx = JobContext::new(1, 1, ProgressReporter::new(id, sink));

        match pool.run(&job, &ctx).await {
            Ok(()) => {
                lock(&state).finish(id, None);
                tracing::info!(job_id = %id, "Job completed");
            }
            Err(e) => {
                lock(&state).finish(id, Some(e.to_string()));
                tracing::error!(
                    job_id = %id,
                    error = %e,
                    "Job failed, degraded queue does not retry"
                );
            }
        }
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    fn mode(&self) -> QueueMode {
        QueueMode::Degraded
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id()))]
    async fn enqueue(&self, job: TranscodeJob) -> Result<JobHandle, QueueError> {
        let id = job.id();
        {
            let mut state = lock(&self.state);
            if state.jobs.get(&id).is_some_and(|j| !j.state.is_finished()) {
                tracing::debug!("Job already pending");
                return Ok(JobHandle { id });
            }
            state.insert_waiting(id);
        }

        match self.tx.try_send(job) {
            Ok(()) => {
                tracing::info!("Job queued in-process");
                Ok(JobHandle { id })
            }
            Err(e) => {
                lock(&self.state).jobs.remove(&id);
                match e {
                    TrySendError::Full(_) => Err(QueueError::Full(self.capacity)),
                    TrySendError::Closed(_) => Err(QueueError::Closed),
                }
            }
        }
    }

    async fn status(&self, id: Uuid) -> Result<Option<JobStatus>, QueueError> {
        Ok(lock(&self.state).jobs.get(&id).map(|job| JobStatus {
            id,
            state: job.state,
            progress: job.progress,
            attempts_made: job.attempts,
            failure_reason: job.failure_reason.clone(),
        }))
    }

    async fn retry_failed(&self) -> Result<usize, QueueError> {
        tracing::warn!("retry-failed only applies to the durable queue");
        Ok(0)
    }

    async fn clear_failed(&self) -> Result<usize, QueueError> {
        tracing::warn!("clear-failed only applies to the durable queue");
        Ok(0)
    }

    async fn shutdown(&self) {
        tracing::info!("Shutting down local job queue");
        let _ = self.shutdown.send(true);
    }
}
