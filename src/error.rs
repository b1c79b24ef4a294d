#![forbid(unsafe_code)]

//! Error taxonomy for the split pipeline.
//!
//! Each variant names the phase it came from so a front end can show an
//! actionable message without digging through logs.

use std::path::PathBuf;

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::planner::PlanningError;
use crate::resolver::ResolveError;

/// Result alias used by the orchestrator and the tool wrappers.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Everything that can end a fetch or a split run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The metadata tool failed or returned something unreadable.
    #[error("metadata fetch failed for {url}: {message}")]
    MetadataFetch { url: String, message: String },

    /// The document was fetched but lacks what segmentation needs.
    #[error("metadata rejected: {0}")]
    MetadataValidation(#[from] MetadataError),

    /// No local media file matched after both resolver tiers.
    #[error("file resolution failed: {0}")]
    FileResolution(#[from] ResolveError),

    /// The download process exited unsuccessfully.
    #[error("download failed ({status}): {stderr}")]
    Download { status: String, stderr: String },

    /// Chapter timing invariants were violated.
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),

    /// A single segment could not be cut.
    #[error("extraction of segment {index:02} \"{title}\" into {} failed: {message}", .output.display())]
    Extraction {
        index: usize,
        title: String,
        output: PathBuf,
        message: String,
    },

    /// A required external program could not be started.
    #[error("{tool} is not available: {message}")]
    ToolUnavailable { tool: String, message: String },

    /// Another fetch or run is still in flight.
    #[error("a {active} task is already running")]
    Busy { active: &'static str },

    /// The request does not make sense in the current state.
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    /// The caller cancelled the run; partial outputs were removed.
    #[error("cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True when the run ended because the caller asked it to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Keeps only the last `max_lines` lines of a tool's stderr so error
/// messages stay readable.
pub(crate) fn stderr_tail(raw: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "no output on stderr".to_string()
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let raw = b"one\n\ntwo\nthree\nfour\n";
        assert_eq!(stderr_tail(raw, 2), "three\nfour");
    }

    #[test]
    fn stderr_tail_reports_silence() {
        assert_eq!(stderr_tail(b"  \n", 5), "no output on stderr");
    }

    #[test]
    fn extraction_error_mentions_segment() {
        let err = PipelineError::Extraction {
            index: 3,
            title: "Main".into(),
            output: PathBuf::from("chapters/03_Main.mp4"),
            message: "Invalid data found".into(),
        };
        let text = err.to_string();
        assert!(text.contains("segment 03"));
        assert!(text.contains("\"Main\""));
        assert!(text.contains("Invalid data found"));
    }

    #[test]
    fn cancelled_is_distinguished() {
        let err = PipelineError::Cancelled {
            phase: "downloading".into(),
        };
        assert!(err.is_cancelled());
        assert!(!PipelineError::Busy { active: "fetch" }.is_cancelled());
    }
}
