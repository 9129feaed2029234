use async_trait::async_trait;
use cadence_core::constants::{
    DEFAULT_LOUDNESS_LUFS, LOUDNESS_RANGE_TARGET_LU, LOUDNESS_TARGET_LUFS, TRUE_PEAK_TARGET_DBTP,
    WAVEFORM_SAMPLE_RATE,
};
use cadence_core::PipelineError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::probe::{parse_bpm, parse_ffprobe_output, parse_loudnorm_output, ProbeInfo};
use super::tags::{read_embedded_picture, read_embedded_tags, EmbeddedPicture, EmbeddedTags};
use super::{AudioAnalysis, AudioAnalyzer};
use crate::process::{run_tool, stderr_tail, StreamingTool};
use crate::waveform::PeakAccumulator;

/// Read size for decoded PCM (16k samples).
const PCM_READ_CHUNK: usize = 64 * 1024;

/// Analyzer backed by ffprobe, ffmpeg and lofty.
#[derive(Debug, Clone)]
pub struct FfmpegAnalyzer {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegAnalyzer {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    async fn probe(&self, path: &Path) -> Result<ProbeInfo, PipelineError> {
        let input = path.to_string_lossy();
        let output = run_tool(
            &self.ffprobe_path,
            [
                "-v",
                "error",
                "-show_format",
                "-show_streams",
                "-of",
                "json",
                input.as_ref(),
            ],
        )
        .await?;

        parse_ffprobe_output(&output.stdout).map_err(PipelineError::Analysis)
    }

    /// Integrated loudness via a loudnorm measurement pass. `None` if it could not be measured.
    async fn measure_loudness(&self, path: &Path) -> Option<f64> {
        let filter = format!(
            "loudnorm=I={}:LRA={}:TP={}:print_format=json",
            LOUDNESS_TARGET_LUFS, LOUDNESS_RANGE_TARGET_LU, TRUE_PEAK_TARGET_DBTP
        );

        let input = path.to_string_lossy();
        let result = run_tool(
            &self.ffmpeg_path,
            [
                "-hide_banner",
                "-nostats",
                "-i",
                input.as_ref(),
                "-vn",
                "-af",
                filter.as_str(),
                "-f",
                "null",
                "-",
            ],
        )
        .await;

        match result {
            Ok(output) => parse_loudnorm_output(&String::from_utf8_lossy(&output.stderr)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Loudness measurement failed");
                None
            }
        }
    }

    async fn embedded_tags(&self, path: &Path) -> EmbeddedTags {
        let owned: PathBuf = path.to_path_buf();
        match tokio::task::spawn_blocking(move || read_embedded_tags(&owned)).await {
            Ok(Ok(tags)) => tags,
            Ok(Err(e)) => {
                debug!(path = %path.display(), error = %e, "No readable embedded tags");
                EmbeddedTags::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Tag reader task failed");
                EmbeddedTags::default()
            }
        }
    }

    /// Re-encode a non-JPEG picture to JPEG by piping it through ffmpeg.
    async fn convert_to_jpeg(&self, data: Vec<u8>) -> Result<Vec<u8>, PipelineError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args([
                "-v", "error", "-i", "pipe:0", "-frames:v", "1", "-c:v", "mjpeg", "-f",
                "image2pipe", "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Analysis(format!("Failed to run ffmpeg: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Internal("ffmpeg stdin unavailable".to_string()))?;
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&data).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PipelineError::Analysis(format!("ffmpeg cover conversion failed: {}", e)))?;

        if let Ok(Err(e)) = writer.await {
            debug!(error = %e, "ffmpeg closed stdin early during cover conversion");
        }

        if !output.status.success() || output.stdout.is_empty() {
            return Err(PipelineError::Analysis(format!(
                "ffmpeg cover conversion failed: {}",
                stderr_tail(&output.stderr)
            )));
        }

        Ok(output.stdout)
    }
}

fn is_jpeg(picture: &EmbeddedPicture) -> bool {
    picture.data.starts_with(&[0xFF, 0xD8, 0xFF])
        || matches!(picture.mime_type.as_deref(), Some("image/jpeg" | "image/jpg"))
}

/// Track metadata from embedded tags, falling back to container tags from ffprobe.
fn merge_metadata(tags: EmbeddedTags, probe: &ProbeInfo) -> EmbeddedTags {
    let from_probe = |key: &str| probe.tag(key).map(String::from);
    EmbeddedTags {
        title: tags.title.or_else(|| from_probe("title")),
        artist: tags
            .artist
            .or_else(|| from_probe("artist"))
            .or_else(|| from_probe("album_artist")),
        album: tags.album.or_else(|| from_probe("album")),
        genre: tags.genre.or_else(|| from_probe("genre")),
        bpm: tags.bpm.or_else(|| {
            probe
                .tag("tbpm")
                .or_else(|| probe.tag("bpm"))
                .and_then(parse_bpm)
        }),
    }
}

#[async_trait]
impl AudioAnalyzer for FfmpegAnalyzer {
    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    async fn analyze(&self, path: &Path) -> Result<AudioAnalysis, PipelineError> {
        let probe = self.probe(path).await?;
        let duration_secs = probe.duration_secs.ok_or_else(|| {
            PipelineError::Analysis(format!("Could not determine duration of {}", path.display()))
        })?;

        let tags = merge_metadata(self.embedded_tags(path).await, &probe);

        let loudness_lufs = match self.measure_loudness(path).await {
            Some(lufs) => lufs,
            None => {
                warn!(
                    path = %path.display(),
                    default_lufs = DEFAULT_LOUDNESS_LUFS,
                    "Loudness unavailable, using default"
                );
                DEFAULT_LOUDNESS_LUFS
            }
        };

        info!(
            duration_secs,
            loudness_lufs,
            bpm = ?tags.bpm,
            codec = ?probe.codec,
            "Audio analysis complete"
        );

        Ok(AudioAnalysis {
            duration_secs,
            tempo_bpm: tags.bpm,
            loudness_lufs,
            title: tags.title,
            artist: tags.artist,
            album: tags.album,
            genre: tags.genre,
        })
    }

    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    async fn waveform(
        &self,
        path: &Path,
        duration_secs: f64,
        points: usize,
    ) -> Result<Vec<f32>, PipelineError> {
        let sample_rate = WAVEFORM_SAMPLE_RATE.to_string();
        let input = path.to_string_lossy();
        let mut decoder = StreamingTool::spawn(
            &self.ffmpeg_path,
            [
                "-v",
                "error",
                "-i",
                input.as_ref(),
                "-vn",
                "-ac",
                "1",
                "-ar",
                sample_rate.as_str(),
                "-f",
                "f32le",
                "pipe:1",
            ],
        )?;

        let expected_samples = (duration_secs.max(0.0) * f64::from(WAVEFORM_SAMPLE_RATE)) as u64;
        let mut peaks = PeakAccumulator::new(expected_samples, points);

        if let Some(mut pcm) = decoder.stdout() {
            let mut buf = vec![0u8; PCM_READ_CHUNK];
            loop {
                let read = pcm.read(&mut buf).await.map_err(|e| {
                    PipelineError::Transcode(format!("Reading decoded PCM: {}", e))
                })?;
                if read == 0 {
                    break;
                }
                peaks.feed(&buf[..read]);
            }
        }
        decoder.finish().await?;

        let samples = peaks.samples();
        let peaks = peaks.finish();

        debug!(samples, expected_samples, points = peaks.len(), "Waveform generated");

        Ok(peaks)
    }

    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    async fn extract_cover(&self, path: &Path) -> Result<Option<Vec<u8>>, PipelineError> {
        let owned = path.to_path_buf();
        let picture = tokio::task::spawn_blocking(move || read_embedded_picture(&owned))
            .await
            .map_err(|e| PipelineError::Internal(format!("Cover reader task failed: {}", e)))?
            .map_err(PipelineError::Analysis)?;

        let Some(picture) = picture else {
            debug!("No embedded cover art");
            return Ok(None);
        };

        if is_jpeg(&picture) {
            return Ok(Some(picture.data));
        }

        debug!(mime_type = ?picture.mime_type, "Converting embedded cover to JPEG");
        self.convert_to_jpeg(picture.data).await.map(Some)
    }
}
