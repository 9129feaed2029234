//! Embedded tag and artwork reading via lofty
//!
//! lofty does blocking file IO; callers run these functions on the blocking pool.

use lofty::file::TaggedFileExt;
use lofty::picture::PictureType;
use lofty::prelude::Accessor;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use std::path::Path;

use super::probe::parse_bpm;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddedTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub bpm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedPicture {
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
}

fn non_empty(value: Option<std::borrow::Cow<'_, str>>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_tag(path: &Path) -> Result<Option<Tag>, String> {
    let tagged_file = Probe::open(path)
        .map_err(|e| format!("Failed to probe {}: {}", path.display(), e))?
        .read()
        .map_err(|e| format!("Failed to read tags from {}: {}", path.display(), e))?;

    Ok(tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag())
        .cloned())
}

/// Title/artist/album/genre/BPM from the file's primary tag.
pub fn read_embedded_tags(path: &Path) -> Result<EmbeddedTags, String> {
    let Some(tag) = read_tag(path)? else {
        return Ok(EmbeddedTags::default());
    };

    let bpm = tag
        .get_string(&ItemKey::Bpm)
        .or_else(|| tag.get_string(&ItemKey::IntegerBpm))
        .and_then(parse_bpm);

    Ok(EmbeddedTags {
        title: non_empty(tag.title()),
        artist: non_empty(tag.artist()),
        album: non_empty(tag.album()),
        genre: non_empty(tag.genre()),
        bpm,
    })
}

/// First embedded picture, preferring the front cover.
pub fn read_embedded_picture(path: &Path) -> Result<Option<EmbeddedPicture>, String> {
    let Some(tag) = read_tag(path)? else {
        return Ok(None);
    };

    let pictures = tag.pictures();
    let picture = pictures
        .iter()
        .find(|pic| pic.pic_type() == PictureType::CoverFront)
        .or_else(|| pictures.first());

    Ok(picture
        .filter(|pic| !pic.data().is_empty())
        .map(|pic| EmbeddedPicture {
            data: pic.data().to_vec(),
            mime_type: pic.mime_type().map(|m| m.to_string()),
        }))
}
