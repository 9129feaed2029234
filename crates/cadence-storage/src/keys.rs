//! Shared key generation for storage backends.
//!
//! Derived artifacts live under `{owner_id}/transcoded/{upload_id}/`, the raw
//! input under `{owner_id}/originals/{YYYY-MM}/{upload_id}/`. All backends must
//! use these helpers so keys stay identical across S3 and local storage.

use crate::traits::StorageError;
use uuid::Uuid;

/// `{owner_id}/transcoded/{upload_id}/`
pub fn transcoded_prefix(owner_id: Uuid, upload_id: Uuid) -> String {
    format!("{}/transcoded/{}/", owner_id, upload_id)
}

/// Key for a derived artifact such as `audio_128.mp3` or `waveform.json`.
pub fn transcoded_key(owner_id: Uuid, upload_id: Uuid, artifact: &str) -> String {
    format!("{}{}", transcoded_prefix(owner_id, upload_id), artifact)
}

/// Key for the untouched input file.
pub fn original_key(owner_id: Uuid, year_month: &str, upload_id: Uuid, file_name: &str) -> String {
    format!(
        "{}/originals/{}/{}/{}",
        owner_id,
        year_month,
        upload_id,
        sanitize_file_name(file_name)
    )
}

/// Strip directory components and characters that would break a key.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "original".to_string()
    } else {
        cleaned
    }
}

/// Reject keys that could escape the storage root.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Content type inferred from a key's extension, for backends that do not store one.
pub fn content_type_for_key(key: &str) -> Option<&'static str> {
    let ext = key.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp3" => Some("audio/mpeg"),
        "json" => Some("application/json"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "flac" => Some("audio/flac"),
        "wav" => Some("audio/wav"),
        "ogg" => Some("audio/ogg"),
        "m4a" => Some("audio/mp4"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcoded_keys_are_scoped_by_owner_and_upload() {
        let owner = Uuid::new_v4();
        let upload = Uuid::new_v4();
        let key = transcoded_key(owner, upload, "audio_128.mp3");
        assert_eq!(key, format!("{}/transcoded/{}/audio_128.mp3", owner, upload));
        assert!(key.starts_with(&transcoded_prefix(owner, upload)));
    }

    #[test]
    fn original_key_drops_directories_from_file_name() {
        let owner = Uuid::new_v4();
        let upload = Uuid::new_v4();
        let key = original_key(owner, "2024-03", upload, "../../etc/song.mp3");
        assert_eq!(key, format!("{}/originals/2024-03/{}/song.mp3", owner, upload));
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn validate_key_rejects_traversal() {
        assert!(validate_key("../secret").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("a/b..c/d").is_ok());
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for_key("x/audio_320.mp3"), Some("audio/mpeg"));
        assert_eq!(content_type_for_key("x/waveform.json"), Some("application/json"));
        assert_eq!(content_type_for_key("x/cover.JPG"), Some("image/jpeg"));
        assert_eq!(content_type_for_key("x/blob"), None);
    }
}
