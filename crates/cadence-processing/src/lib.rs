//! Cadence Media Processing Library
//!
//! Everything the worker needs to turn one raw audio file into publishable
//! artifacts: container sniffing, analysis (duration, tags, loudness, cover
//! art), peak waveform generation and bitrate transcodes. External tools are
//! driven as subprocesses and hidden behind the `AudioAnalyzer` and
//! `Transcoder` traits.

pub mod audio;
mod process;
pub mod transcode;
pub mod validator;
pub mod waveform;

// Re-export commonly used types
pub use audio::{AudioAnalysis, AudioAnalyzer, FfmpegAnalyzer};
pub use process::ToolError;
pub use transcode::{Bitrate, FfmpegTranscoder, TranscodeOutput, TranscodeRequest, Transcoder};
pub use validator::{sniff_container, validate_input_file, ContainerKind, ValidationError};
pub use waveform::{downsample_peaks, PeakAccumulator, WaveformDocument};
