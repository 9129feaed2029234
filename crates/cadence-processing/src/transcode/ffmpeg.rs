use async_trait::async_trait;
use cadence_core::PipelineError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::progress::ProgressParser;
use super::{ProgressFn, TranscodeOutput, TranscodeRequest, Transcoder};
use crate::process::stderr_tail;

/// MP3 transcoder driving `ffmpeg` with libmp3lame.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn build_args(request: &TranscodeRequest) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            request.input.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:a:0".to_string(),
            "-vn".to_string(),
            "-codec:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            request.bitrate.ffmpeg_arg(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-f".to_string(),
            "mp3".to_string(),
            request.output.to_string_lossy().to_string(),
        ]
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[tracing::instrument(
        skip(self, request, progress),
        fields(bitrate = %request.bitrate, input = %request.input.display())
    )]
    async fn transcode(
        &self,
        request: TranscodeRequest,
        progress: ProgressFn<'_>,
    ) -> Result<TranscodeOutput, PipelineError> {
        let start = std::time::Instant::now();

        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut child = Command::new(&self.ffmpeg_path)
            .args(Self::build_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Transcode(format!("Failed to run ffmpeg: {}", e)))?;

        // Drain stderr concurrently so a chatty ffmpeg never blocks on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut parser = ProgressParser::new(request.duration_secs);
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| PipelineError::Transcode(format!("Reading ffmpeg progress: {}", e)))?
            {
                if let Some(fraction) = parser.parse_line(&line) {
                    progress(fraction);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| PipelineError::Transcode(format!("Waiting for ffmpeg: {}", e)))?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            return Err(PipelineError::Transcode(format!(
                "ffmpeg {} transcode exited with {}: {}",
                request.bitrate,
                status,
                stderr_tail(&stderr)
            )));
        }

        let size_bytes = tokio::fs::metadata(&request.output)
            .await
            .map_err(|e| {
                PipelineError::Transcode(format!(
                    "ffmpeg reported success but {} is missing: {}",
                    request.output.display(),
                    e
                ))
            })?
            .len();

        if size_bytes == 0 {
            return Err(PipelineError::Transcode(format!(
                "ffmpeg produced an empty {} output",
                request.bitrate
            )));
        }

        progress(1.0);

        info!(
            output = %request.output.display(),
            size_bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            "Transcode complete"
        );
        debug!(stderr = %stderr_tail(&stderr), "ffmpeg stderr");

        Ok(TranscodeOutput {
            path: request.output,
            size_bytes,
        })
    }
}
