//! Pipeline-wide constants.

/// Sample rate used for waveform decoding and recorded in the waveform document.
pub const WAVEFORM_SAMPLE_RATE: u32 = 44_100;

/// Default number of points in a published waveform.
pub const DEFAULT_WAVEFORM_POINTS: usize = 1000;

/// Integrated loudness target (LUFS) for the loudness measurement pass.
pub const LOUDNESS_TARGET_LUFS: f64 = -23.0;

/// Loudness range target (LU).
pub const LOUDNESS_RANGE_TARGET_LU: f64 = 7.0;

/// True peak ceiling (dBTP).
pub const TRUE_PEAK_TARGET_DBTP: f64 = -2.0;

/// Fallback used when no loudness measurement could be taken.
pub const DEFAULT_LOUDNESS_LUFS: f64 = LOUDNESS_TARGET_LUFS;

/// Fallback artist when the file carries no artist tag.
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Artifact file names under `{owner}/transcoded/{upload}/`.
pub const ARTIFACT_AUDIO_128: &str = "audio_128.mp3";
pub const ARTIFACT_AUDIO_320: &str = "audio_320.mp3";
pub const ARTIFACT_WAVEFORM: &str = "waveform.json";
pub const ARTIFACT_COVER: &str = "cover.jpg";

pub const CONTENT_TYPE_MPEG: &str = "audio/mpeg";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";
