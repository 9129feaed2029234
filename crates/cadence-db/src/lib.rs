//! Cadence DB Library
//!
//! Persistence for the two records the transcoding pipeline touches: `Upload`
//! (in-flight state, single source of truth for callers polling an outcome)
//! and `Track` (the published result). Postgres repositories run on sqlx; the
//! `memory` feature adds drop-in in-memory stores.

pub mod error;
#[cfg(feature = "memory")]
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod setup;

pub use error::{DbError, DbResult};
#[cfg(feature = "memory")]
pub use memory::{InMemoryTrackStore, InMemoryUploadStore};
pub use postgres::{PgTrackStore, PgUploadStore};
pub use repository::{TrackStore, UploadStore};
pub use setup::setup_database;
