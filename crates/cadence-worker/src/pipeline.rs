//! Transcode pipeline
//!
//! One job runs these stages strictly in order, reporting progress after each:
//!
//! | stage | progress |
//! |---|---|
//! | claim, Upload -> `Processing`, input checks | 5 |
//! | analysis (duration, tags, tempo, loudness) | 20 |
//! | waveform | 30 |
//! | cover art (optional) | 40 |
//! | 128 kbps transcode | 40 -> 60 |
//! | 320 kbps transcode | 60 -> 80 |
//! | artifact upload | 90 |
//! | Track creation with Upload -> `Completed` in one write, temp cleanup | 90 |
//! | done | 100 |
//!
//! The pipeline is the only writer of an Upload's terminal state. On failure it
//! decides between a terminal outcome (Upload `Failed`, temp input deleted) and
//! a retryable one (error recorded, input kept) from the error's recoverability
//! and the attempt number. Outputs under `{work_dir}/{upload_id}/` are removed
//! after every attempt.

use async_trait::async_trait;
use cadence_core::constants::UNKNOWN_ARTIST;
use cadence_core::models::{NewTrack, TranscodeJob, Upload};
use cadence_core::{JobError, LogLevel, PipelineError};
use cadence_db::{TrackStore, UploadStore};
use cadence_processing::{
    validate_input_file, AudioAnalysis, AudioAnalyzer, Bitrate, TranscodeRequest, Transcoder,
    WaveformDocument,
};
use cadence_storage::Storage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::{JobContext, JobHandler};
use crate::progress::ProgressReporter;
use crate::publisher::{ArtifactPublisher, ArtifactSet, PublishedArtifacts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Claimed,
    Analyzing,
    WaveformGenerated,
    CoverExtracted,
    Transcoding128,
    Transcoding320,
    Uploading,
    TrackCreated,
    Completed,
    Cleaned,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Claimed => "claimed",
            Stage::Analyzing => "analyzing",
            Stage::WaveformGenerated => "waveform_generated",
            Stage::CoverExtracted => "cover_extracted",
            Stage::Transcoding128 => "transcoding_128",
            Stage::Transcoding320 => "transcoding_320",
            Stage::Uploading => "uploading",
            Stage::TrackCreated => "track_created",
            Stage::Completed => "completed",
            Stage::Cleaned => "cleaned",
            Stage::Done => "done",
        }
    }

    /// Progress reported once the stage has finished.
    pub fn checkpoint(self) -> u8 {
        match self {
            Stage::Claimed => 5,
            Stage::Analyzing => 20,
            Stage::WaveformGenerated => 30,
            Stage::CoverExtracted => 40,
            Stage::Transcoding128 => 60,
            Stage::Transcoding320 => 80,
            Stage::Uploading
            | Stage::TrackCreated
            | Stage::Completed
            | Stage::Cleaned => 90,
            Stage::Done => 100,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct TranscodePipeline {
    uploads: Arc<dyn UploadStore>,
    tracks: Arc<dyn TrackStore>,
    publisher: ArtifactPublisher,
    analyzer: Arc<dyn AudioAnalyzer>,
    transcoder: Arc<dyn Transcoder>,
    work_dir: PathBuf,
    waveform_points: usize,
}

impl TranscodePipeline {
    pub fn new(
        uploads: Arc<dyn UploadStore>,
        tracks: Arc<dyn TrackStore>,
        storage: Arc<dyn Storage>,
        analyzer: Arc<dyn AudioAnalyzer>,
        transcoder: Arc<dyn Transcoder>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            uploads,
            tracks,
            publisher: ArtifactPublisher::new(storage),
            analyzer,
            transcoder,
            work_dir: work_dir.into(),
            waveform_points: cadence_core::constants::DEFAULT_WAVEFORM_POINTS,
        }
    }

    pub fn with_waveform_points(mut self, points: usize) -> Self {
        self.waveform_points = points.max(1);
        self
    }

    fn output_dir(&self, job: &TranscodeJob) -> PathBuf {
        self.work_dir.join(job.upload_id.to_string())
    }

    async fn run_stages(
        &self,
        job: &TranscodeJob,
        progress: &ProgressReporter,
        output_dir: &Path,
        stage: &mut Stage,
    ) -> Result<(), PipelineError> {
        let input = Path::new(&job.temp_path);

        *stage = Stage::Claimed;
        let upload = self.uploads.mark_processing(job.upload_id).await?;
        validate_input_file(input, &upload.mime_type).await?;
        self.checkpoint(job, progress, *stage);

        *stage = Stage::Analyzing;
        let analysis = self.analyzer.analyze(input).await?;
        self.checkpoint(job, progress, *stage);

        *stage = Stage::WaveformGenerated;
        let peaks = self
            .analyzer
            .waveform(input, analysis.duration_secs, self.waveform_points)
            .await?;
        let waveform_json =
            WaveformDocument::new(peaks, analysis.duration_secs).to_json_bytes()?;
        self.checkpoint(job, progress, *stage);

        *stage = Stage::CoverExtracted;
        let cover = match self.analyzer.extract_cover(input).await {
            Ok(cover) => cover,
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id(),
                    error = %e,
                    "Cover extraction failed, continuing without cover"
                );
                None
            }
        };
        self.checkpoint(job, progress, *stage);

        *stage = Stage::Transcoding128;
        let audio_128 = self
            .transcode(input, output_dir, Bitrate::Kbps128, &analysis, progress, 40, 60)
            .await?;
        self.checkpoint(job, progress, *stage);

        *stage = Stage::Transcoding320;
        let audio_320 = self
            .transcode(input, output_dir, Bitrate::Kbps320, &analysis, progress, 60, 80)
            .await?;
        self.checkpoint(job, progress, *stage);

        *stage = Stage::Uploading;
        let published = self
            .publisher
            .publish(ArtifactSet {
                owner_id: job.user_id,
                upload_id: job.upload_id,
                year_month: &job.year_month,
                original_path: input,
                original_file_name: &job.temp_file_name,
                original_mime_type: &upload.mime_type,
                audio_128_path: &audio_128,
                audio_320_path: &audio_320,
                waveform_json,
                cover,
            })
            .await?;
        self.checkpoint(job, progress, *stage);

        *stage = Stage::TrackCreated;
        let new_track = build_track(job, &upload, analysis, published);
        new_track.check_ready().map_err(PipelineError::Internal)?;
        let track = self.tracks.materialize(new_track, job.upload_id).await?;
        *stage = Stage::Completed;
        tracing::info!(job_id = %job.id(), track_id = %track.id, title = %track.title, "Track ready");
        self.checkpoint(job, progress, *stage);

        *stage = Stage::Cleaned;
        remove_file_logged(job, stage.as_str(), input).await;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn transcode(
        &self,
        input: &Path,
        output_dir: &Path,
        bitrate: Bitrate,
        analysis: &AudioAnalysis,
        progress: &ProgressReporter,
        start: u8,
        end: u8,
    ) -> Result<PathBuf, PipelineError> {
        let output = output_dir.join(format!("audio_{}.mp3", bitrate.kbps()));
        let on_progress = |fraction: f64| progress.report_within(start, end, fraction);

        let result = self
            .transcoder
            .transcode(
                TranscodeRequest {
                    input: input.to_path_buf(),
                    output,
                    bitrate,
                    duration_secs: analysis.duration_secs,
                },
                &on_progress,
            )
            .await?;

        Ok(result.path)
    }

    fn checkpoint(&self, job: &TranscodeJob, progress: &ProgressReporter, stage: Stage) {
        progress.report(stage.checkpoint());
        tracing::debug!(job_id = %job.id(), stage = %stage, progress = progress.current(), "Stage finished");
    }

    /// Persist the outcome of a failed attempt. Terminal failures also drop the temp input.
    async fn settle_failure(
        &self,
        job: &TranscodeJob,
        ctx: &JobContext,
        stage: &str,
        message: &str,
        recoverable: bool,
    ) {
        let terminal = !recoverable || ctx.is_last_attempt();

        if terminal {
            if let Err(e) = self.uploads.mark_failed(job.upload_id, message).await {
                tracing::error!(job_id = %job.id(), stage, error = %e, "Failed to mark upload failed");
            }
            remove_file_logged(job, stage, Path::new(&job.temp_path)).await;
        } else if let Err(e) = self
            .uploads
            .record_attempt_error(job.upload_id, message)
            .await
        {
            tracing::warn!(job_id = %job.id(), stage, error = %e, "Failed to record attempt error");
        }

        tracing::info!(
            job_id = %job.id(),
            stage,
            attempt = ctx.attempt,
            max_attempts = ctx.max_attempts,
            terminal,
            "Job attempt settled as failed"
        );
    }
}

#[async_trait]
impl JobHandler for TranscodePipeline {
    #[tracing::instrument(
        skip(self, job, ctx),
        fields(job_id = %job.id(), user_id = %job.user_id, attempt = ctx.attempt)
    )]
    async fn handle(&self, job: &TranscodeJob, ctx: &JobContext) -> Result<(), JobError> {
        let output_dir = self.output_dir(job);
        let mut stage = Stage::Claimed;

        let result = self
            .run_stages(job, &ctx.progress, &output_dir, &mut stage)
            .await;

        remove_dir_logged(job, stage.as_str(), &output_dir).await;

        match result {
            Ok(()) => {
                ctx.progress.report(Stage::Done.checkpoint());
                tracing::info!(stage = %Stage::Done, "Transcode pipeline finished");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                let code = err.error_code();
                match err.log_level() {
                    LogLevel::Debug => {
                        tracing::debug!(stage = %stage, code, error = %message, "Pipeline stage failed")
                    }
                    LogLevel::Warn => {
                        tracing::warn!(stage = %stage, code, error = %message, "Pipeline stage failed")
                    }
                    LogLevel::Error => {
                        tracing::error!(stage = %stage, code, error = %message, "Pipeline stage failed")
                    }
                }
                if matches!(err, PipelineError::AlreadyMaterialized(_)) {
                    tracing::error!(
                        stage = %stage,
                        "Track already exists for this upload, manual cleanup required"
                    );
                }
                self.settle_failure(job, ctx, stage.as_str(), &message, err.is_recoverable())
                    .await;
                Err(JobError::from(err))
            }
        }
    }

    async fn abandoned(&self, job: &TranscodeJob, ctx: &JobContext, error: &JobError) {
        remove_dir_logged(job, "timeout", &self.output_dir(job)).await;
        self.settle_failure(job, ctx, "timeout", &error.to_string(), error.is_recoverable())
            .await;
    }
}

fn build_track(
    job: &TranscodeJob,
    upload: &Upload,
    analysis: AudioAnalysis,
    published: PublishedArtifacts,
) -> NewTrack {
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

    let title = non_empty(analysis.title).unwrap_or_else(|| {
        Path::new(&upload.original_filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| upload.original_filename.clone())
    });

    NewTrack {
        id: job.upload_id,
        owner_id: job.user_id,
        title,
        artist: non_empty(analysis.artist).unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
        album: non_empty(analysis.album),
        genre: non_empty(analysis.genre),
        duration_sec: analysis.duration_secs,
        bpm: analysis.tempo_bpm,
        loudness_lufs: analysis.loudness_lufs,
        audio_128_key: published.audio_128_key,
        audio_320_key: published.audio_320_key,
        waveform_json_key: published.waveform_json_key,
        cover_key: published.cover_key,
        original_key: Some(published.original_key),
    }
}

async fn remove_file_logged(job: &TranscodeJob, stage: &str, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(job_id = %job.id(), stage, path = %path.display(), "Removed temp file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            job_id = %job.id(),
            stage,
            path = %path.display(),
            error = %e,
            "Failed to remove temp file"
        ),
    }
}

async fn remove_dir_logged(job: &TranscodeJob, stage: &str, path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            job_id = %job.id(),
            stage,
            path = %path.display(),
            error = %e,
            "Failed to remove transcode outputs"
        ),
    }
}
