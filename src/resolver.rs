#![forbid(unsafe_code)]

//! Locates an already-downloaded media file in the working directory.
//!
//! The download tool sanitizes titles on its own terms, so the predicted
//! filename is only trusted byte-for-byte on the fast path. Everything else
//! goes through a normalized containment match where the most recently
//! modified candidate wins, which keeps stale partial files from older
//! attempts out of the way.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Container suffixes accepted as media candidates.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no media file in {} matches {}", .dir.display(), describe_hints(.expected.as_deref(), .title.as_deref()))]
    NotFound {
        dir: PathBuf,
        expected: Option<String>,
        title: Option<String>,
    },

    #[error("could not scan {}: {source}", .dir.display())]
    Scan {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

fn describe_hints(expected: Option<&str>, title: Option<&str>) -> String {
    match (expected, title) {
        (Some(expected), Some(title)) => format!("\"{expected}\" or title \"{title}\""),
        (Some(expected), None) => format!("\"{expected}\""),
        (None, Some(title)) => format!("title \"{title}\""),
        (None, None) => "no name hints".to_string(),
    }
}

/// How a file was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    ExpectedName,
    TitleHint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub matched_by: MatchKind,
}

impl ResolvedFile {
    /// Container extension without the dot, e.g. `mp4`.
    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
    }
}

/// Finds the file best matching `expected_name` or `title_hint` directly
/// inside `dir`.
pub fn resolve(
    expected_name: Option<&str>,
    title_hint: Option<&str>,
    dir: &Path,
) -> Result<ResolvedFile, ResolveError> {
    let expected_name = expected_name.map(str::trim).filter(|name| !name.is_empty());
    let title_hint = title_hint.map(str::trim).filter(|title| !title.is_empty());

    if let Some(name) = expected_name {
        let exact = dir.join(name);
        if let Ok(meta) = exact.metadata()
            && meta.is_file()
        {
            debug!(path = %exact.display(), "expected file exists");
            return Ok(ResolvedFile {
                path: exact,
                modified: to_utc(meta.modified().ok()),
                matched_by: MatchKind::Exact,
            });
        }
    }

    let candidates = list_media_files(dir)?;

    let tiers = [
        (expected_name.map(file_stem_key), MatchKind::ExpectedName),
        (title_hint.map(normalize_key), MatchKind::TitleHint),
    ];
    for (key, kind) in tiers {
        let Some(key) = key.filter(|key| !key.is_empty()) else {
            continue;
        };
        let best = candidates
            .iter()
            .filter(|candidate| keys_overlap(&candidate.key, &key))
            .max_by(|a, b| {
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| a.path.cmp(&b.path))
            });
        if let Some(best) = best {
            debug!(path = %best.path.display(), ?kind, "fuzzy match");
            return Ok(ResolvedFile {
                path: best.path.clone(),
                modified: to_utc(Some(best.modified)),
                matched_by: kind,
            });
        }
    }

    Err(ResolveError::NotFound {
        dir: dir.to_path_buf(),
        expected: expected_name.map(str::to_owned),
        title: title_hint.map(str::to_owned),
    })
}

/// Letters of any script, digits and `_` only, lowercased.
pub fn normalize_key(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn file_stem_key(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    normalize_key(&stem)
}

fn keys_overlap(candidate: &str, key: &str) -> bool {
    !candidate.is_empty() && (candidate.contains(key) || key.contains(candidate))
}

struct Candidate {
    path: PathBuf,
    key: String,
    modified: SystemTime,
}

fn list_media_files(dir: &Path) -> Result<Vec<Candidate>, ResolveError> {
    let mut candidates = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|source| ResolveError::Scan {
            dir: dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_video = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                VIDEO_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });
        if !is_video {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push(Candidate {
            key: file_stem_key(&entry.file_name().to_string_lossy()),
            path: path.to_path_buf(),
            modified,
        });
    }
    Ok(candidates)
}

fn to_utc(time: Option<SystemTime>) -> DateTime<Utc> {
    DateTime::<Utc>::from(time.unwrap_or(SystemTime::UNIX_EPOCH))
}
