//! Data models for the transcoding pipeline
//!
//! `Upload` and `Track` are the two persisted records the pipeline touches;
//! `job` holds the queue-level types that never reach the database.

mod job;
mod track;
mod upload;

pub use job::*;
pub use track::*;
pub use upload::*;
