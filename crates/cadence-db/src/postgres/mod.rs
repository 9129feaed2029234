//! Postgres repositories

mod track;
mod upload;

pub use track::PgTrackStore;
pub use upload::PgUploadStore;
