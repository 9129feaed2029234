//! Parsers for ffprobe JSON and the loudnorm measurement report

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    format: Option<FFprobeFormat>,
    streams: Option<Vec<FFprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<i32>,
    duration: Option<String>,
}

/// What ffprobe tells us about a file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub duration_secs: Option<f64>,
    pub bit_rate: Option<u64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<i32>,
    pub codec: Option<String>,
    /// Container-level tags, keys lowercased
    pub tags: HashMap<String, String>,
}

impl ProbeInfo {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Parse `ffprobe -show_format -show_streams -of json` output.
///
/// Fails if there is no audio stream.
pub fn parse_ffprobe_output(stdout: &[u8]) -> Result<ProbeInfo, String> {
    let parsed: FFprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| format!("Failed to parse ffprobe output: {}", e))?;

    let audio_stream = parsed
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .ok_or_else(|| "No audio stream found".to_string())?;

    let format = parsed.format;

    let duration_secs = format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(audio_stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0);

    let bit_rate = format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u64>().ok());

    let tags = format
        .map(|f| {
            f.tags
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect()
        })
        .unwrap_or_default();

    Ok(ProbeInfo {
        duration_secs,
        bit_rate,
        sample_rate: audio_stream
            .sample_rate
            .as_deref()
            .and_then(|sr| sr.parse::<u32>().ok()),
        channels: audio_stream.channels,
        codec: audio_stream.codec_name,
        tags,
    })
}

#[derive(Debug, Deserialize)]
struct LoudnormReport {
    input_i: String,
}

/// Extract integrated loudness (`input_i`, LUFS) from ffmpeg's stderr when run
/// with `loudnorm=...:print_format=json`.
///
/// Returns `None` when the report is missing or the value is not a finite number
/// (silence reports `-inf`).
pub fn parse_loudnorm_output(stderr: &str) -> Option<f64> {
    let start = stderr.rfind('{')?;
    let end = start + stderr[start..].find('}')?;
    let report: LoudnormReport = serde_json::from_str(&stderr[start..=end]).ok()?;
    report
        .input_i
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Parse a BPM tag value such as `"128"`, `"127.5"` or `"128 BPM"`.
pub fn parse_bpm(raw: &str) -> Option<f64> {
    let numeric: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    numeric
        .parse::<f64>()
        .ok()
        .filter(|bpm| bpm.is_finite() && *bpm > 0.0 && *bpm < 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFPROBE_JSON: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "mjpeg"},
            {"codec_type": "audio", "codec_name": "mp3", "sample_rate": "44100", "channels": 2, "duration": "180.010000"}
        ],
        "format": {
            "duration": "180.035918",
            "bit_rate": "128000",
            "tags": {"TITLE": "Song", "artist": "Band", "TBPM": "124"}
        }
    }"#;

    #[test]
    fn test_parse_ffprobe() {
        let info = parse_ffprobe_output(FFPROBE_JSON.as_bytes()).unwrap();
        assert!((info.duration_secs.unwrap() - 180.0).abs() < 1.0);
        assert_eq!(info.bit_rate, Some(128_000));
        assert_eq!(info.sample_rate, Some(44_100));
        assert_eq!(info.channels, Some(2));
        assert_eq!(info.codec.as_deref(), Some("mp3"));
        assert_eq!(info.tag("title"), Some("Song"));
        assert_eq!(info.tag("tbpm"), Some("124"));
    }

    #[test]
    fn test_parse_ffprobe_without_audio_stream() {
        let json = r#"{"streams": [{"codec_type": "video"}], "format": {"duration": "1.0"}}"#;
        assert!(parse_ffprobe_output(json.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_ffprobe_falls_back_to_stream_duration() {
        let json = r#"{"streams": [{"codec_type": "audio", "duration": "12.5"}], "format": {}}"#;
        let info = parse_ffprobe_output(json.as_bytes()).unwrap();
        assert_eq!(info.duration_secs, Some(12.5));
    }

    #[test]
    fn test_parse_loudnorm() {
        let stderr = r#"size=N/A time=00:03:00.03 bitrate=N/A speed= 412x
[Parsed_loudnorm_0 @ 0x600000c8c000]
{
	"input_i" : "-14.27",
	"input_tp" : "-0.51",
	"input_lra" : "6.30",
	"input_thresh" : "-24.45",
	"output_i" : "-23.04",
	"output_tp" : "-7.71",
	"output_lra" : "5.60",
	"output_thresh" : "-33.21",
	"normalization_type" : "dynamic",
	"target_offset" : "0.04"
}
"#;
        assert_eq!(parse_loudnorm_output(stderr), Some(-14.27));
    }

    #[test]
    fn test_parse_loudnorm_silence_and_garbage() {
        let silent = r#"{ "input_i" : "-inf", "input_tp" : "-inf" }"#;
        assert_eq!(parse_loudnorm_output(silent), None);
        assert_eq!(parse_loudnorm_output("ffmpeg: error"), None);
    }

    #[test]
    fn test_parse_bpm() {
        assert_eq!(parse_bpm("128"), Some(128.0));
        assert_eq!(parse_bpm(" 127.5 BPM"), Some(127.5));
        assert_eq!(parse_bpm("0"), None);
        assert_eq!(parse_bpm("fast"), None);
    }
}
