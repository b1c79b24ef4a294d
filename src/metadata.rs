#![forbid(unsafe_code)]

//! Metadata model for a single remote video.
//!
//! The download tool emits a loosely typed `info.json` document where almost
//! every field may be missing. Everything optional is decoded into `RawInfo`
//! first and then normalized here, so the rest of the crate only ever sees a
//! `VideoMetadata` with a duration and at least one chapter.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Title given to chapters that have none, and to the implicit chapter
/// synthesized when the source has no chapter list.
pub const DEFAULT_CHAPTER_TITLE: &str = "Chapter";

/// Formats taller than this are hidden unless configured otherwise.
pub const DEFAULT_MAX_HEIGHT: u32 = 1080;

const INFO_JSON_SUFFIX: &str = ".info.json";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("malformed metadata document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("metadata has no title")]
    MissingTitle,

    /// Segmentation is impossible without a total duration.
    #[error("metadata has no duration")]
    MissingDuration,

    #[error("duration {0} is not a finite, non-negative number of seconds")]
    InvalidDuration(f64),

    #[error("chapter {index} is invalid: {reason}")]
    InvalidChapter { index: usize, reason: String },

    #[error("could not read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Named start point inside the source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(default)]
    pub title: String,
    pub start_time: f64,
}

impl Chapter {
    pub fn new(title: impl Into<String>, start_time: f64) -> Self {
        Self {
            title: title.into(),
            start_time,
        }
    }
}

/// One selectable encoding. Only used to build a selector; never decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub height: Option<u32>,
    pub ext: String,
    pub vcodec: String,
    pub acodec: Option<String>,
    pub note: String,
    /// Selector handed to the download tool. Video-only encodings already
    /// carry the `+bestaudio/best` expansion.
    pub selector: FormatSelector,
}

impl FormatOption {
    /// Human label, also the deduplication key: `1080p (mp4) - 1080p60`.
    pub fn label(&self) -> String {
        let height = self
            .height
            .map(|value| format!("{value}p"))
            .unwrap_or_else(|| "?p".to_string());
        format!("{height} ({}) - {}", self.ext, self.note)
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.is_some()
    }
}

/// Opaque selector token understood by the download tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatSelector(String);

impl FormatSelector {
    /// Catch-all: best video under the ceiling plus best audio, falling back
    /// to the best combined stream under the ceiling.
    pub fn best_under(max_height: u32) -> Self {
        Self(format!(
            "bestvideo[height<={max_height}]+bestaudio/best[height<={max_height}]"
        ))
    }

    /// Exact encoding; `needs_audio` pairs it with the best audio stream.
    pub fn exact(format_id: &str, needs_audio: bool) -> Self {
        if needs_audio {
            Self(format!("{format_id}+bestaudio/best"))
        } else {
            Self(format_id.to_string())
        }
    }

    /// Selector string passed through untouched.
    pub fn raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FormatSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical, immutable view of a fetched metadata document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub id: Option<String>,
    pub title: String,
    /// Total length in seconds.
    pub duration: f64,
    pub channel: Option<String>,
    pub thumbnail: Option<String>,
    /// Page and request URLs recorded by the tool, used to tell whether a
    /// cached document belongs to a given URL.
    pub webpage_url: Option<String>,
    pub original_url: Option<String>,
    /// Never empty: a single implicit chapter is synthesized when the source
    /// has none.
    pub chapters: Vec<Chapter>,
    pub formats: Vec<FormatOption>,
    /// Set when `chapters` holds the synthesized whole-video chapter.
    pub chapters_synthesized: bool,
}

impl VideoMetadata {
    /// Parses a raw `info.json` document, keeping formats up to `max_height`.
    pub fn from_json(raw: &str, max_height: u32) -> Result<Self, MetadataError> {
        let info: RawInfo = serde_json::from_str(raw)?;
        Self::from_raw(info, max_height)
    }

    fn from_raw(info: RawInfo, max_height: u32) -> Result<Self, MetadataError> {
        let title = info
            .title
            .or(info.fulltitle)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(MetadataError::MissingTitle)?;

        let duration = info.duration.ok_or(MetadataError::MissingDuration)?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(MetadataError::InvalidDuration(duration));
        }

        let channel = first_name(info.channel.as_ref())
            .or_else(|| first_name(info.uploader.as_ref()))
            .map(str::to_owned);

        let mut chapters = Vec::new();
        for (index, raw) in info.chapters.unwrap_or_default().into_iter().enumerate() {
            let start_time = raw.start_time.ok_or_else(|| MetadataError::InvalidChapter {
                index: index + 1,
                reason: "missing start_time".to_string(),
            })?;
            chapters.push(Chapter {
                title: raw.title.unwrap_or_default().trim().to_string(),
                start_time,
            });
        }

        let chapters_synthesized = chapters.is_empty();
        if chapters_synthesized {
            debug!(%title, "no chapters in metadata, using a single implicit chapter");
            chapters.push(Chapter::new(DEFAULT_CHAPTER_TITLE, 0.0));
        }

        let formats = filter_formats(info.formats.as_deref().unwrap_or_default(), max_height);

        Ok(Self {
            id: info.id.filter(|value| !value.trim().is_empty()),
            title,
            duration,
            channel,
            thumbnail: non_blank(info.thumbnail),
            webpage_url: non_blank(info.webpage_url),
            original_url: non_blank(info.original_url),
            chapters,
            formats,
            chapters_synthesized,
        })
    }

    /// Selector for a caller-chosen format id. Unknown ids are passed
    /// through as raw selectors; `None` picks the catch-all.
    pub fn selector_for(&self, format_id: Option<&str>, max_height: u32) -> FormatSelector {
        let Some(requested) = format_id.map(str::trim).filter(|value| !value.is_empty()) else {
            return FormatSelector::best_under(max_height);
        };
        self.formats
            .iter()
            .find(|option| option.format_id == requested)
            .map(|option| option.selector.clone())
            .unwrap_or_else(|| FormatSelector::raw(requested))
    }

    /// True when this document was produced for `url`: one of the recorded
    /// URLs is identical, or the id appears in it as a whole token.
    pub fn matches_url(&self, url: &str) -> bool {
        let url = url.trim();
        if url.is_empty() {
            return false;
        }
        let same_url = [&self.webpage_url, &self.original_url]
            .into_iter()
            .flatten()
            .any(|recorded| recorded.trim() == url);
        same_url
            || self
                .id
                .as_deref()
                .is_some_and(|id| contains_token(url, id.trim()))
    }

    /// File name used when caching the raw document in the working directory.
    pub fn cache_file_name(&self) -> String {
        let stem = self
            .id
            .as_deref()
            .map(str::to_owned)
            .unwrap_or_else(|| crate::planner::sanitize_title(&self.title));
        format!("{stem}{INFO_JSON_SUFFIX}")
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// `needle` occurs in `haystack` with no id characters directly around it.
fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_id_char) && !after.is_some_and(is_id_char)
    })
}

/// Keeps video encodings at or below `max_height`, dropping later entries
/// whose label repeats an earlier one.
pub fn filter_formats(formats: &[RawFormat], max_height: u32) -> Vec<FormatOption> {
    let mut seen = HashSet::new();
    let mut options = Vec::new();

    for format in formats {
        let Some(format_id) = format
            .format_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        // Only an explicit "none" marks an audio-only or storyboard entry.
        let vcodec = match format.vcodec.as_deref().map(str::trim) {
            Some(codec) if codec.eq_ignore_ascii_case("none") => continue,
            Some(codec) if !codec.is_empty() => codec.to_owned(),
            _ => "unknown".to_owned(),
        };
        let Some(height) = format.height.filter(|height| *height > 0) else {
            continue;
        };
        if height > u64::from(max_height) {
            continue;
        }
        let Ok(height) = u32::try_from(height) else {
            continue;
        };

        let acodec = usable_codec(format.acodec.as_deref()).map(str::to_owned);
        let option = FormatOption {
            format_id: format_id.to_owned(),
            height: Some(height),
            ext: format.ext.clone().unwrap_or_default(),
            vcodec,
            selector: FormatSelector::exact(format_id, acodec.is_none()),
            acodec,
            note: format.format_note.clone().unwrap_or_default(),
        };

        if seen.insert(option.label()) {
            options.push(option);
        }
    }

    options
}

fn usable_codec(codec: Option<&str>) -> Option<&str> {
    codec
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("none"))
}

/// Returns the lexicographically first `*.info.json` in `dir` that was
/// produced for `url`, already parsed. Documents for other videos and
/// unreadable documents are skipped.
pub fn find_cached_metadata(
    dir: &Path,
    url: &str,
    max_height: u32,
) -> Result<Option<(PathBuf, VideoMetadata)>, MetadataError> {
    for path in list_info_json(dir)? {
        match load_info_json(&path, max_height) {
            Ok(metadata) if metadata.matches_url(url) => return Ok(Some((path, metadata))),
            Ok(_) => debug!(path = %path.display(), "cached metadata belongs to another video"),
            Err(err) => debug!(path = %path.display(), error = %err, "skipping cached metadata"),
        }
    }
    Ok(None)
}

fn list_info_json(dir: &Path) -> Result<Vec<PathBuf>, MetadataError> {
    let entries = fs::read_dir(dir).map_err(|source| MetadataError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(INFO_JSON_SUFFIX))
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    Ok(matches)
}

/// Loads and normalizes a cached document.
pub fn load_info_json(path: &Path, max_height: u32) -> Result<VideoMetadata, MetadataError> {
    let raw = fs::read_to_string(path).map_err(|source| MetadataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    VideoMetadata::from_json(&raw, max_height)
}

/// Reads a chapter override file: either a bare list or an object with a
/// `chapters` key, each entry `{"start_time": number, "title": text}`.
pub fn read_chapter_file(path: &Path) -> Result<Vec<Chapter>, MetadataError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ChapterFile {
        List(Vec<Chapter>),
        Wrapped { chapters: Vec<Chapter> },
    }

    let raw = fs::read_to_string(path).map_err(|source| MetadataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let chapters = match serde_json::from_str::<ChapterFile>(&raw)? {
        ChapterFile::List(chapters) => chapters,
        ChapterFile::Wrapped { chapters } => chapters,
    };
    Ok(chapters
        .into_iter()
        .map(|chapter| Chapter {
            title: chapter.title.trim().to_string(),
            start_time: chapter.start_time,
        })
        .collect())
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        match self {
            OneOrMany::One(value) => Box::new(std::iter::once(value)),
            OneOrMany::Many(values) => Box::new(values.iter()),
        }
    }
}

/// Channel and uploader fields show up either as plain names or as objects.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum CreatorInfo {
    Name(String),
    Object {
        name: Option<String>,
        title: Option<String>,
    },
}

impl CreatorInfo {
    fn name(&self) -> Option<&str> {
        match self {
            CreatorInfo::Name(value) => Some(value.as_str()),
            CreatorInfo::Object { name, title } => name.as_deref().or(title.as_deref()),
        }
    }
}

fn first_name(field: Option<&OneOrMany<CreatorInfo>>) -> Option<&str> {
    field?
        .iter()
        .filter_map(CreatorInfo::name)
        .map(str::trim)
        .find(|name| !name.is_empty())
}

/// Subset of the tool's metadata document this crate reads. Everything is
/// optional because older or unusual sources omit fields freely.
#[derive(Debug, Deserialize)]
struct RawInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    duration: Option<f64>,
    channel: Option<OneOrMany<CreatorInfo>>,
    uploader: Option<OneOrMany<CreatorInfo>>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    chapters: Option<Vec<RawChapter>>,
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
struct RawChapter {
    start_time: Option<f64>,
    title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub height: Option<u64>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub format_note: Option<String>,
}
