//! Audio analysis
//!
//! `AudioAnalyzer` is the seam between the worker pipeline and the tools that
//! inspect audio. The production implementation is `FfmpegAnalyzer`; tests
//! substitute scripted analyzers.

mod ffmpeg;
pub mod probe;
pub mod tags;

use async_trait::async_trait;
use cadence_core::PipelineError;
use std::path::Path;

pub use ffmpeg::FfmpegAnalyzer;

/// Everything the pipeline learns about an input before transcoding.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioAnalysis {
    pub duration_secs: f64,
    pub tempo_bpm: Option<f64>,
    /// Integrated loudness in LUFS. Defaults to the -23 target when unmeasurable.
    pub loudness_lufs: f64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
}

#[async_trait]
pub trait AudioAnalyzer: Send + Sync {
    /// Duration, tags, tempo and loudness. Loudness failures never fail the call.
    async fn analyze(&self, path: &Path) -> Result<AudioAnalysis, PipelineError>;

    /// Mono 44.1 kHz absolute peaks downsampled to `points` values in [0, 1].
    /// `duration_secs` comes from [`AudioAnalyzer::analyze`] and sizes the peak blocks.
    async fn waveform(
        &self,
        path: &Path,
        duration_secs: f64,
        points: usize,
    ) -> Result<Vec<f32>, PipelineError>;

    /// Embedded cover art as JPEG bytes, `None` when the file has none.
    async fn extract_cover(&self, path: &Path) -> Result<Option<Vec<u8>>, PipelineError>;
}
