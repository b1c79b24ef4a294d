#![forbid(unsafe_code)]

//! Lossless stream-copy cut specifications.
//!
//! The seek is placed before the input is opened, which is fast but snaps to
//! the nearest preceding keyframe. That is inherent to stream copy and not a
//! planning error.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::planner::Segment;
use crate::resolver::ResolvedFile;

/// Everything the extraction tool needs to cut one segment. Pure data; no
/// I/O happens while building it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionSpec {
    pub index: usize,
    pub title: String,
    pub source: PathBuf,
    pub output: PathBuf,
    /// Input seek offset in seconds.
    pub seek: f64,
    /// Length of the cut in seconds.
    pub duration: f64,
    /// First video stream, plus the first audio stream when one exists.
    pub stream_maps: Vec<&'static str>,
    /// Copy streams instead of re-encoding.
    pub copy: bool,
    /// Shift timestamps so each output starts at zero.
    pub zero_timestamps: bool,
    /// Move the container index to the front for progressive playback.
    pub faststart: bool,
}

impl ExtractionSpec {
    /// Cut `segment` out of `source` into `output_dir`, keeping the source's
    /// container extension.
    pub fn build(source: &ResolvedFile, segment: &Segment, output_dir: &Path) -> Self {
        let output = output_dir.join(segment.file_name(source.extension()));
        Self {
            index: segment.index,
            title: segment.title.clone(),
            source: source.path.clone(),
            output,
            seek: segment.start,
            duration: segment.length,
            stream_maps: vec!["0:v:0", "0:a?"],
            copy: true,
            zero_timestamps: true,
            faststart: true,
        }
    }

    /// Argument list for ffmpeg, excluding the program name.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]
            .into_iter()
            .map(OsString::from)
            .collect();

        args.push("-ss".into());
        args.push(format_seconds(self.seek).into());
        args.push("-i".into());
        args.push(self.source.clone().into_os_string());
        args.push("-t".into());
        args.push(format_seconds(self.duration).into());

        for map in &self.stream_maps {
            args.push("-map".into());
            args.push((*map).into());
        }
        if self.copy {
            args.push("-c".into());
            args.push("copy".into());
        }
        if self.zero_timestamps {
            args.push("-avoid_negative_ts".into());
            args.push("make_zero".into());
        }
        if self.faststart {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }

        args.push(self.output.clone().into_os_string());
        args
    }
}

/// Seconds with millisecond precision and no trailing zeros: `120`, `61.25`.
pub fn format_seconds(seconds: f64) -> String {
    let text = format!("{:.3}", seconds.max(0.0));
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MatchKind;
    use chrono::Utc;

    fn source(path: &str) -> ResolvedFile {
        ResolvedFile {
            path: PathBuf::from(path),
            modified: Utc::now(),
            matched_by: MatchKind::Exact,
        }
    }

    fn segment(index: usize, title: &str, start: f64, length: f64) -> Segment {
        Segment {
            index,
            title: title.into(),
            start,
            length,
        }
    }

    #[test]
    fn builds_stream_copy_command() {
        let spec = ExtractionSpec::build(
            &source("work/Talk.mkv"),
            &segment(2, "Main Part", 120.0, 180.0),
            Path::new("work/chapters"),
        );
        assert_eq!(spec.output, PathBuf::from("work/chapters/02_Main_Part.mkv"));

        let args: Vec<String> = spec
            .to_args()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-nostdin",
                "-loglevel",
                "error",
                "-y",
                "-ss",
                "120",
                "-i",
                "work/Talk.mkv",
                "-t",
                "180",
                "-map",
                "0:v:0",
                "-map",
                "0:a?",
                "-c",
                "copy",
                "-avoid_negative_ts",
                "make_zero",
                "-movflags",
                "+faststart",
                "work/chapters/02_Main_Part.mkv",
            ]
        );
    }

    #[test]
    fn seek_precedes_input() {
        let spec = ExtractionSpec::build(
            &source("a.mp4"),
            &segment(1, "Intro", 0.0, 10.0),
            Path::new("out"),
        );
        let args = spec.to_args();
        let seek = args.iter().position(|arg| arg == "-ss").unwrap();
        let input = args.iter().position(|arg| arg == "-i").unwrap();
        assert!(seek < input);
    }

    #[test]
    fn output_name_is_sanitized() {
        let spec = ExtractionSpec::build(
            &source("dir/v.webm"),
            &segment(10, "Q&A: what <now>?", 1.5, 2.0),
            Path::new("chapters"),
        );
        assert_eq!(spec.output, PathBuf::from("chapters/10_Q&A_what_now.webm"));
    }

    #[test]
    fn seconds_are_compact() {
        assert_eq!(format_seconds(0.0), "0");
        assert_eq!(format_seconds(120.0), "120");
        assert_eq!(format_seconds(61.25), "61.25");
        assert_eq!(format_seconds(1.23456), "1.235");
        assert_eq!(format_seconds(-3.0), "0");
    }
}
