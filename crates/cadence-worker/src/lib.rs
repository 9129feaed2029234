//! Cadence Worker Library
//!
//! The asynchronous half of the transcoding pipeline. Uploads enter through
//! [`UploadIntake`], become [`TranscodeJob`](cadence_core::models::TranscodeJob)s
//! on a [`JobQueue`], and are executed by a bounded [`WorkerPool`] running the
//! [`TranscodePipeline`].
//!
//! The queue backend is picked once by [`connect_queue`]: Redis when the broker
//! answers a ping in time, otherwise an in-process queue that runs jobs on the
//! same pool without retries.

pub mod context;
pub mod intake;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod publisher;
pub mod queue;

pub use context::{JobContext, JobHandler};
pub use intake::{IntakeError, Submission, UploadIntake};
pub use pipeline::{Stage, TranscodePipeline};
pub use pool::WorkerPool;
pub use progress::{ProgressReporter, ProgressSink};
pub use publisher::{ArtifactPublisher, ArtifactSet, PublishedArtifacts};
pub use queue::{connect_queue, JobQueue, LocalQueue, QueueError, RedisQueue};
