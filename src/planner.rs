#![forbid(unsafe_code)]

//! Turns an ordered chapter list into concrete, gap-free segments.

use serde::Serialize;
use thiserror::Error;

use crate::metadata::{Chapter, DEFAULT_CHAPTER_TITLE};

/// Characters that are not allowed in output file names on common filesystems.
const FORBIDDEN_FILENAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error("duration {0} is not a finite, non-negative number of seconds")]
    InvalidDuration(f64),

    #[error("chapter {index} \"{title}\" has invalid start time {start}")]
    InvalidStart {
        index: usize,
        title: String,
        start: f64,
    },

    #[error("chapter {index} \"{title}\" starts at {start}s, before the previous chapter at {previous}s")]
    Unsorted {
        index: usize,
        title: String,
        start: f64,
        previous: f64,
    },

    #[error("chapter {index} \"{title}\" starts at {start}s, beyond the {duration}s duration")]
    BeyondDuration {
        index: usize,
        title: String,
        start: f64,
        duration: f64,
    },
}

/// A `[start, start + length)` range destined for one output file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// 1-based position, also the file name prefix.
    pub index: usize,
    pub title: String,
    pub start: f64,
    pub length: f64,
}

impl Segment {
    pub fn end(&self) -> f64 {
        self.start + self.length
    }

    /// `{index:02}_{sanitized title}{ext}`; `ext` may be given with or
    /// without the leading dot.
    pub fn file_name(&self, ext: &str) -> String {
        let ext = ext.trim_start_matches('.');
        let stem = format!("{:02}_{}", self.index, sanitize_title(&self.title));
        if ext.is_empty() {
            stem
        } else {
            format!("{stem}.{ext}")
        }
    }
}

/// Computes one segment per chapter. Chapters are not reordered; broken
/// ordering is reported instead of producing a negative length.
pub fn plan(chapters: &[Chapter], duration: f64) -> Result<Vec<Segment>, PlanningError> {
    if !duration.is_finite() || duration < 0.0 {
        return Err(PlanningError::InvalidDuration(duration));
    }

    if chapters.is_empty() {
        return Ok(vec![Segment {
            index: 1,
            title: DEFAULT_CHAPTER_TITLE.to_string(),
            start: 0.0,
            length: duration,
        }]);
    }

    let mut segments = Vec::with_capacity(chapters.len());
    for (position, chapter) in chapters.iter().enumerate() {
        let index = position + 1;
        let title = display_title(&chapter.title);
        let start = chapter.start_time;

        if !start.is_finite() || start < 0.0 {
            return Err(PlanningError::InvalidStart { index, title, start });
        }
        if start > duration {
            return Err(PlanningError::BeyondDuration {
                index,
                title,
                start,
                duration,
            });
        }

        let end = match chapters.get(position + 1) {
            Some(next) => {
                let next_title = display_title(&next.title);
                if !next.start_time.is_finite() || next.start_time < 0.0 {
                    return Err(PlanningError::InvalidStart {
                        index: index + 1,
                        title: next_title,
                        start: next.start_time,
                    });
                }
                if next.start_time < start {
                    return Err(PlanningError::Unsorted {
                        index: index + 1,
                        title: next_title,
                        start: next.start_time,
                        previous: start,
                    });
                }
                next.start_time
            }
            None => duration,
        };

        segments.push(Segment {
            index,
            title,
            start,
            length: end - start,
        });
    }

    Ok(segments)
}

fn display_title(title: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        DEFAULT_CHAPTER_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Strips `\ / : * ? " < > |`, trims, and turns spaces into underscores.
pub fn sanitize_title(title: &str) -> String {
    let stripped: String = title
        .chars()
        .filter(|c| !FORBIDDEN_FILENAME_CHARS.contains(c))
        .collect();
    stripped.trim().replace(' ', "_")
}
