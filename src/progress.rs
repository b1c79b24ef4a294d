#![forbid(unsafe_code)]

//! Best-effort parser for the download tool's status lines, e.g.
//! `[download]  45.3% of 120.00MiB at 5.00MiB/s ETA 00:12`.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::trace;

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\]\s+(\d+(?:\.\d*)?%).*?\bETA\s+(\d+:\d{2}(?::\d{2})?)\b")
        .expect("progress pattern compiles")
});

/// One progress tick. Both fields are kept as the tool printed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Percentage including the `%` sign, e.g. `45.3%`.
    pub percent: String,
    /// Remaining time as `MM:SS` or `HH:MM:SS`.
    pub eta: String,
}

impl ProgressEvent {
    /// Numeric percentage clamped to `0..=100`.
    pub fn percent_value(&self) -> Option<f64> {
        self.percent
            .trim_end_matches('%')
            .parse::<f64>()
            .ok()
            .map(|value| value.clamp(0.0, 100.0))
    }
}

/// Parses a single complete line. Anything that is not a status line with
/// an ETA yields `None`.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let captures = PROGRESS_LINE.captures(line)?;
    Some(ProgressEvent {
        percent: captures.get(1)?.as_str().to_string(),
        eta: captures.get(2)?.as_str().to_string(),
    })
}

/// Line assembler over raw output chunks.
///
/// Reads from a pipe do not respect line boundaries, so the unterminated
/// tail of each chunk is kept until its newline (or carriage return, which
/// the tool uses to redraw the status line) arrives.
#[derive(Debug, Default)]
pub struct ProgressParser {
    pending: Vec<u8>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one already-complete line.
    pub fn feed(&mut self, line: &str) -> Option<ProgressEvent> {
        let event = parse_line(line);
        if event.is_none() && !line.trim().is_empty() {
            trace!(line, "ignoring non-progress output");
        }
        event
    }

    /// Appends a raw chunk and returns the events of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                let line = std::mem::take(&mut self.pending);
                if let Some(event) = self.feed(&String::from_utf8_lossy(&line)) {
                    events.push(event);
                }
            } else {
                self.pending.push(byte);
            }
        }
        events
    }

    /// Flushes a final unterminated line once the stream has ended.
    pub fn finish(&mut self) -> Option<ProgressEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        self.feed(&String::from_utf8_lossy(&line))
    }
}
