//! Bitrate transcoding
//!
//! Orchestration only sees `Transcoder`: an input path, a target bitrate and a
//! progress callback receiving the completed fraction. Which tool produces the
//! MP3 and how it reports progress stays inside the implementation.

mod ffmpeg;
pub mod progress;

use async_trait::async_trait;
use cadence_core::PipelineError;
use std::fmt;
use std::path::PathBuf;

pub use ffmpeg::FfmpegTranscoder;

/// Published MP3 bitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitrate {
    Kbps128,
    Kbps320,
}

impl Bitrate {
    pub fn kbps(self) -> u32 {
        match self {
            Bitrate::Kbps128 => 128,
            Bitrate::Kbps320 => 320,
        }
    }

    /// Value for ffmpeg's `-b:a`
    pub fn ffmpeg_arg(self) -> String {
        format!("{}k", self.kbps())
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}kbps", self.kbps())
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    /// Written by the transcoder; the caller owns cleanup.
    pub output: PathBuf,
    pub bitrate: Bitrate,
    /// Known input duration, used to turn the tool's position into a fraction.
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOutput {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Progress callback, called with the completed fraction in [0, 1].
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        request: TranscodeRequest,
        progress: ProgressFn<'_>,
    ) -> Result<TranscodeOutput, PipelineError>;
}
