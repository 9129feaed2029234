//! Input validation run before any expensive work
//!
//! Everything rejected here is an input error: the job fails without a
//! transcode attempt and is never retried.

use cadence_core::PipelineError;
use std::path::Path;
use tokio::io::AsyncReadExt;

const SNIFF_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Temp file {0} no longer exists")]
    Missing(String),

    #[error("Temp file {path} is unreadable: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Temp file {0} is empty (0 bytes)")]
    EmptyFile(String),

    #[error("Invalid content type: {0} (expected audio/*)")]
    InvalidContentType(String),

    #[error("Unrecognized audio container in {0}")]
    UnrecognizedContainer(String),
}

impl From<ValidationError> for PipelineError {
    fn from(err: ValidationError) -> Self {
        PipelineError::Input(err.to_string())
    }
}

/// Container formats recognised from the first bytes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// MP3 with an ID3v2 header
    Id3,
    /// Raw MPEG/ADTS frames
    MpegFrames,
    Wav,
    Aiff,
    Ogg,
    Flac,
    /// ISO base media (m4a, mp4)
    Mp4,
    /// Matroska/WebM
    Matroska,
}

/// Identify the container from a file header, or `None` if unknown.
pub fn sniff_container(header: &[u8]) -> Option<ContainerKind> {
    if header.len() < 4 {
        return None;
    }

    if header.starts_with(b"ID3") {
        return Some(ContainerKind::Id3);
    }
    if header[0] == 0xFF && (header[1] & 0xE0) == 0xE0 {
        return Some(ContainerKind::MpegFrames);
    }
    if header.starts_with(b"OggS") {
        return Some(ContainerKind::Ogg);
    }
    if header.starts_with(b"fLaC") {
        return Some(ContainerKind::Flac);
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(ContainerKind::Matroska);
    }
    if header.len() >= 12 {
        if header.starts_with(b"RIFF") && &header[8..12] == b"WAVE" {
            return Some(ContainerKind::Wav);
        }
        if header.starts_with(b"FORM") && (&header[8..12] == b"AIFF" || &header[8..12] == b"AIFC")
        {
            return Some(ContainerKind::Aiff);
        }
    }
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return Some(ContainerKind::Mp4);
    }

    None
}

/// Accept `audio/*` and the generic binary type browsers send for unknown files.
pub fn validate_content_type(mime_type: &str) -> Result<(), ValidationError> {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if essence.starts_with("audio/") || essence == "application/octet-stream" {
        Ok(())
    } else {
        Err(ValidationError::InvalidContentType(mime_type.to_string()))
    }
}

/// Check that the temp file exists, is non-empty, carries an audio MIME type
/// and starts with a known audio container signature.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub async fn validate_input_file(
    path: &Path,
    mime_type: &str,
) -> Result<ContainerKind, ValidationError> {
    let display = path.display().to_string();

    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::Missing(display))
        }
        Err(e) => {
            return Err(ValidationError::Unreadable {
                path: display,
                reason: e.to_string(),
            })
        }
    };

    if !meta.is_file() {
        return Err(ValidationError::Unreadable {
            path: display,
            reason: "not a regular file".to_string(),
        });
    }
    if meta.len() == 0 {
        return Err(ValidationError::EmptyFile(display));
    }

    validate_content_type(mime_type)?;

    let mut header = Vec::with_capacity(SNIFF_LEN);
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ValidationError::Unreadable {
            path: display.clone(),
            reason: e.to_string(),
        })?;
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(|e| ValidationError::Unreadable {
            path: display.clone(),
            reason: e.to_string(),
        })?;

    let kind = sniff_container(&header).ok_or(ValidationError::UnrecognizedContainer(display))?;

    tracing::debug!(container = ?kind, size_bytes = meta.len(), "Input file accepted");

    Ok(kind)
}
