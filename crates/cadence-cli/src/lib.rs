//! Wiring shared by the `cadence` subcommands: stores, storage, analyzer,
//! pipeline, pool and queue built from one `Config`.

use anyhow::Context;
use cadence_core::Config;
use cadence_db::{
    setup_database, InMemoryTrackStore, InMemoryUploadStore, PgTrackStore, PgUploadStore,
    TrackStore, UploadStore,
};
use cadence_processing::{FfmpegAnalyzer, FfmpegTranscoder};
use cadence_storage::create_storage;
use cadence_worker::{connect_queue, JobQueue, TranscodePipeline, UploadIntake, WorkerPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Subdirectory of `WORK_DIR` that holds accepted raw files until processed.
pub const INCOMING_DIR: &str = "incoming";

pub struct Runtime {
    pub config: Config,
    pub uploads: Arc<dyn UploadStore>,
    pub tracks: Arc<dyn TrackStore>,
    pub pool: WorkerPool,
    pub queue: Arc<dyn JobQueue>,
    pub intake: UploadIntake,
}

impl Runtime {
    /// Build every component. `consume` starts broker consumers; the degraded
    /// queue always runs its jobs in this process.
    pub async fn build(config: Config, consume: bool) -> anyhow::Result<Self> {
        let (uploads, tracks) = open_stores(&config).await?;

        let storage = create_storage(&config.storage)
            .await
            .context("Failed to initialize storage backend")?;

        let processing = &config.processing;
        tokio::fs::create_dir_all(&processing.work_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create work directory {}",
                    processing.work_dir.display()
                )
            })?;

        let pipeline = TranscodePipeline::new(
            uploads.clone(),
            tracks.clone(),
            storage,
            Arc::new(FfmpegAnalyzer::new(
                processing.ffmpeg_path.as_str(),
                processing.ffprobe_path.as_str(),
            )),
            Arc::new(FfmpegTranscoder::new(processing.ffmpeg_path.as_str())),
            processing.work_dir.clone(),
        )
        .with_waveform_points(processing.waveform_points);

        let pool = WorkerPool::new(
            Arc::new(pipeline),
            config.queue.concurrency,
            config.queue.job_timeout(),
        );
        let queue = connect_queue(&config.queue, pool.clone(), consume).await;
        let intake = UploadIntake::new(uploads.clone(), queue.clone());

        Ok(Self {
            config,
            uploads,
            tracks,
            pool,
            queue,
            intake,
        })
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.config.processing.work_dir.join(INCOMING_DIR)
    }
}

async fn open_stores(
    config: &Config,
) -> anyhow::Result<(Arc<dyn UploadStore>, Arc<dyn TrackStore>)> {
    if config.uses_memory_database() {
        tracing::warn!("Using in-memory stores; uploads and tracks are lost on exit");
        let uploads = InMemoryUploadStore::new();
        let tracks = InMemoryTrackStore::linked(&uploads);
        return Ok((Arc::new(uploads), Arc::new(tracks)));
    }

    let pool = setup_database(&config.database_url, config.db_max_connections).await?;
    Ok((
        Arc::new(PgUploadStore::new(pool.clone())),
        Arc::new(PgTrackStore::new(pool)),
    ))
}

/// Copy `source` into `incoming_dir` under a name unique to `upload_id`.
/// Returns the temp path handed to the pipeline.
pub async fn stage_input(
    source: &Path,
    incoming_dir: &Path,
    upload_id: Uuid,
) -> anyhow::Result<PathBuf> {
    let file_name = source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", source.display()))?;

    tokio::fs::create_dir_all(incoming_dir)
        .await
        .with_context(|| format!("Failed to create {}", incoming_dir.display()))?;

    let target = incoming_dir.join(format!("{}-{}", upload_id, file_name));
    tokio::fs::copy(source, &target).await.with_context(|| {
        format!("Failed to copy {} to {}", source.display(), target.display())
    })?;
    Ok(target)
}

/// Declared MIME type from the file extension. Unknown extensions are sent as
/// `application/octet-stream` and left to container sniffing.
pub fn guess_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg") | Some("oga") | Some("opus") => "audio/ogg",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("aif") | Some("aiff") => "audio/aiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_from_extension() {
        assert_eq!(guess_mime(Path::new("Song.MP3")), "audio/mpeg");
        assert_eq!(guess_mime(Path::new("/a/b/take.flac")), "audio/flac");
        assert_eq!(guess_mime(Path::new("noext")), "application/octet-stream");
        assert_eq!(guess_mime(Path::new("cover.png")), "application/octet-stream");
    }

    #[tokio::test]
    async fn staged_copy_is_prefixed_with_upload_id() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("My Song.mp3");
        tokio::fs::write(&source, b"ID3 data").await.unwrap();
        let incoming = dir.path().join("work").join(INCOMING_DIR);
        let id = Uuid::new_v4();

        let staged = stage_input(&source, &incoming, id).await.unwrap();

        assert_eq!(staged, incoming.join(format!("{}-My Song.mp3", id)));
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), b"ID3 data");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn staging_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = stage_input(
            &dir.path().join("missing.mp3"),
            &dir.path().join(INCOMING_DIR),
            Uuid::new_v4(),
        )
        .await;
        assert!(result.is_err());
    }
}
