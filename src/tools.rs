#![forbid(unsafe_code)]

//! Invocations of the external download and extraction programs.
//!
//! Every call runs with an explicit working directory; nothing here touches
//! the process-wide current directory.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result, stderr_tail};
use crate::extract::ExtractionSpec;
use crate::metadata::FormatSelector;
use crate::progress::{ProgressEvent, ProgressParser};

/// Output template handed to the download tool.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

const STDERR_TAIL_LINES: usize = 20;

/// Locations of the two external programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            yt_dlp: PathBuf::from("yt-dlp"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl Toolchain {
    /// Runs `<tool> --version` / `ffmpeg -version` for both programs so a
    /// missing binary is reported before any work starts.
    pub async fn ensure_available(&self) -> Result<()> {
        self.ensure_downloader_available().await?;
        ensure_program_available(&self.ffmpeg, "-version").await?;
        Ok(())
    }

    /// Checks only the download tool, for work that never cuts anything.
    pub async fn ensure_downloader_available(&self) -> Result<()> {
        ensure_program_available(&self.yt_dlp, "--version").await
    }

    /// Returns the raw metadata document for `url`.
    pub async fn fetch_metadata(
        &self,
        url: &str,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut command = Command::new(&self.yt_dlp);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(url)
            .current_dir(work_dir);

        let output = run_to_completion(command, &self.yt_dlp, cancel, "fetching metadata")
            .await
            .map_err(|err| match err {
                PipelineError::ToolUnavailable { message, .. } => PipelineError::MetadataFetch {
                    url: url.to_string(),
                    message,
                },
                other => other,
            })?;

        if !output.status.success() {
            return Err(PipelineError::MetadataFetch {
                url: url.to_string(),
                message: format!(
                    "{} ({})",
                    stderr_tail(&output.stderr, STDERR_TAIL_LINES),
                    output.status
                ),
            });
        }

        String::from_utf8(output.stdout).map_err(|err| PipelineError::MetadataFetch {
            url: url.to_string(),
            message: format!("response is not UTF-8: {err}"),
        })
    }

    /// Asks the download tool which filename it would write, without
    /// downloading. Failures are logged and yield `None`; the resolver can
    /// still fall back to the title.
    pub async fn predict_filename(
        &self,
        url: &str,
        selector: &FormatSelector,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let mut command = Command::new(&self.yt_dlp);
        command
            .arg("--get-filename")
            .arg("--no-warnings")
            .arg("-f")
            .arg(selector.as_str())
            .arg("-o")
            .arg(OUTPUT_TEMPLATE)
            .arg(url)
            .current_dir(work_dir);

        let output = match run_to_completion(command, &self.yt_dlp, cancel, "resolving").await {
            Ok(output) => output,
            Err(err @ PipelineError::Cancelled { .. }) => return Err(err),
            Err(err) => {
                warn!(error = %err, "filename prediction failed");
                return Ok(None);
            }
        };

        if !output.status.success() {
            warn!(
                status = %output.status,
                stderr = %stderr_tail(&output.stderr, STDERR_TAIL_LINES),
                "filename prediction failed"
            );
            return Ok(None);
        }

        let predicted = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_owned);
        debug!(?predicted, "predicted filename");
        Ok(predicted)
    }

    /// Downloads `url` into `work_dir`, reporting parsed progress lines in
    /// the order the tool prints them.
    pub async fn download(
        &self,
        url: &str,
        selector: &FormatSelector,
        work_dir: &Path,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<()> {
        let mut command = Command::new(&self.yt_dlp);
        command
            .arg("-f")
            .arg(selector.as_str())
            .arg("-o")
            .arg(OUTPUT_TEMPLATE)
            .arg("--newline")
            .arg("--no-warnings")
            .arg(url)
            .current_dir(work_dir);

        let mut child = spawn_piped(command, &self.yt_dlp)?;
        let mut stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(read_all(stderr));

        let mut parser = ProgressParser::new();
        let mut buffer = vec![0u8; 8 * 1024];
        if let Some(stdout) = stdout.as_mut() {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        terminate(&mut child).await;
                        return Err(PipelineError::Cancelled { phase: "downloading".into() });
                    }
                    read = stdout.read(&mut buffer) => {
                        match read {
                            Ok(0) => break,
                            Ok(count) => {
                                for event in parser.push(&buffer[..count]) {
                                    on_progress(event);
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "reading download output failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        if let Some(event) = parser.finish() {
            on_progress(event);
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(PipelineError::Cancelled { phase: "downloading".into() });
            }
            status = child.wait() => status?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(PipelineError::Download {
                status: status.to_string(),
                stderr: stderr_tail(&stderr, STDERR_TAIL_LINES),
            });
        }
        info!("download finished");
        Ok(())
    }

    /// Performs one stream-copy cut. On cancellation or failure the partial
    /// output file is removed.
    pub async fn extract(&self, spec: &ExtractionSpec, cancel: &CancellationToken) -> Result<()> {
        let mut command = Command::new(&self.ffmpeg);
        command.args(spec.to_args());
        debug!(output = %spec.output.display(), "running extraction");

        let result = run_to_completion(command, &self.ffmpeg, cancel, "splitting").await;
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                remove_partial(&spec.output).await;
                return Err(match err {
                    PipelineError::ToolUnavailable { message, .. } => PipelineError::Extraction {
                        index: spec.index,
                        title: spec.title.clone(),
                        output: spec.output.clone(),
                        message,
                    },
                    other => other,
                });
            }
        };

        if !output.status.success() {
            remove_partial(&spec.output).await;
            return Err(PipelineError::Extraction {
                index: spec.index,
                title: spec.title.clone(),
                output: spec.output.clone(),
                message: format!(
                    "{} ({})",
                    stderr_tail(&output.stderr, STDERR_TAIL_LINES),
                    output.status
                ),
            });
        }
        Ok(())
    }
}

async fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(PipelineError::ToolUnavailable {
            tool: program.display().to_string(),
            message: format!("installed but `{version_flag}` returned {status}"),
        }),
        Err(err) => Err(PipelineError::ToolUnavailable {
            tool: program.display().to_string(),
            message: format!("not installed or not in PATH: {err}"),
        }),
    }
}

fn spawn_piped(mut command: Command, program: &Path) -> Result<Child> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command.spawn().map_err(|err| PipelineError::ToolUnavailable {
        tool: program.display().to_string(),
        message: format!("failed to start: {err}"),
    })
}

/// Runs a command to completion while honouring cancellation.
async fn run_to_completion(
    command: Command,
    program: &Path,
    cancel: &CancellationToken,
    phase: &str,
) -> Result<Output> {
    let mut child = spawn_piped(command, program)?;
    let stdout_task = tokio::spawn(read_all(child.stdout.take()));
    let stderr_task = tokio::spawn(read_all(child.stderr.take()));

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Err(PipelineError::Cancelled { phase: phase.to_string() });
        }
        status = child.wait() => status?,
    };

    Ok(Output {
        status,
        stdout: stdout_task.await.unwrap_or_default(),
        stderr: stderr_task.await.unwrap_or_default(),
    })
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut bytes = Vec::new();
    if let Some(mut reader) = reader
        && let Err(err) = reader.read_to_end(&mut bytes).await
    {
        debug!(error = %err, "could not drain child output");
    }
    bytes
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(error = %err, "could not terminate child process");
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial output"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove partial output"),
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an executable bash script standing in for an external tool.
    pub fn install_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\nset -u\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::test_support::install_stub;
    use super::*;
    use crate::planner::Segment;
    use crate::resolver::{MatchKind, ResolvedFile};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn toolchain(yt_dlp: PathBuf, ffmpeg: PathBuf) -> Toolchain {
        Toolchain { yt_dlp, ffmpeg }
    }

    fn spec_in(dir: &Path) -> ExtractionSpec {
        let source = ResolvedFile {
            path: dir.join("Talk.mp4"),
            modified: chrono::Utc::now(),
            matched_by: MatchKind::Exact,
        };
        let segment = Segment {
            index: 1,
            title: "Intro".into(),
            start: 0.0,
            length: 5.0,
        };
        ExtractionSpec::build(&source, &segment, &dir.join("chapters"))
    }

    #[tokio::test]
    async fn missing_tool_is_reported() {
        let tools = toolchain(
            PathBuf::from("/nonexistent/yt-dlp-missing"),
            PathBuf::from("/nonexistent/ffmpeg-missing"),
        );
        let err = tools.ensure_available().await.unwrap_err();
        assert!(matches!(err, PipelineError::ToolUnavailable { .. }));
    }

    #[tokio::test]
    async fn downloader_check_ignores_missing_ffmpeg() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "yt-dlp", "echo 2025.01.01");
        let tools = toolchain(stub, PathBuf::from("/nonexistent/ffmpeg-missing"));
        tools.ensure_downloader_available().await.unwrap();
        let err = tools.ensure_available().await.unwrap_err();
        match err {
            PipelineError::ToolUnavailable { tool, .. } => assert!(tool.contains("ffmpeg")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fetch_metadata_returns_stdout() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            r#"echo '{"title": "T", "duration": 5}'"#,
        );
        let tools = toolchain(stub, PathBuf::from("ffmpeg"));
        let raw = tools
            .fetch_metadata("https://v.example/1", dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(raw.contains("\"duration\": 5"));
    }

    #[tokio::test]
    async fn fetch_metadata_failure_carries_stderr() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            "echo 'ERROR: Video unavailable' >&2\nexit 1",
        );
        let tools = toolchain(stub, PathBuf::from("ffmpeg"));
        let err = tools
            .fetch_metadata("https://v.example/1", dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::MetadataFetch { url, message } => {
                assert_eq!(url, "https://v.example/1");
                assert!(message.contains("Video unavailable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn predict_filename_takes_last_line_and_tolerates_failure() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "yt-dlp", "echo 'noise'\necho 'My Talk.webm'");
        let tools = toolchain(stub, PathBuf::from("ffmpeg"));
        let selector = FormatSelector::best_under(1080);
        let cancel = CancellationToken::new();
        let predicted = tools
            .predict_filename("u", &selector, dir.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(predicted.as_deref(), Some("My Talk.webm"));

        let failing = install_stub(dir.path(), "yt-dlp-fail", "exit 2");
        let tools = toolchain(failing, PathBuf::from("ffmpeg"));
        let predicted = tools
            .predict_filename("u", &selector, dir.path(), &cancel)
            .await
            .unwrap();
        assert!(predicted.is_none());
    }

    #[tokio::test]
    async fn download_streams_progress_in_order() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            r#"echo '[info] Downloading webpage'
printf '[download]  10.0%% of 5.00MiB at 1.00MiB/s ETA 00:04\n'
printf '[download]  55.5%% of 5.00MiB at 1.00MiB/s ETA 00:02\r'
printf '[download]  99.0%% of 5.00MiB at 1.00MiB/s ETA 00:00\n'
echo 'video' > "Talk.mp4""#,
        );
        let tools = toolchain(stub, PathBuf::from("ffmpeg"));
        let mut seen = Vec::new();
        tools
            .download(
                "u",
                &FormatSelector::best_under(1080),
                dir.path(),
                &CancellationToken::new(),
                |event| seen.push(event.percent),
            )
            .await
            .unwrap();
        assert_eq!(seen, vec!["10.0%", "55.5%", "99.0%"]);
        assert!(dir.path().join("Talk.mp4").exists());
    }

    #[tokio::test]
    async fn download_failure_reports_status() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            "echo 'ERROR: Requested format is not available' >&2\nexit 1",
        );
        let tools = toolchain(stub, PathBuf::from("ffmpeg"));
        let err = tools
            .download(
                "u",
                &FormatSelector::raw("999"),
                dir.path(),
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::Download { stderr, .. } => {
                assert!(stderr.contains("Requested format is not available"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn download_can_be_cancelled() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "yt-dlp", "sleep 30");
        let tools = toolchain(stub, PathBuf::from("ffmpeg"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = tools
            .download("u", &FormatSelector::raw("b"), dir.path(), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn extract_writes_output_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("chapters")).unwrap();
        let ffmpeg = install_stub(
            dir.path(),
            "ffmpeg",
            r#"for last in "$@"; do :; done
echo "cut" > "$last""#,
        );
        let tools = toolchain(PathBuf::from("yt-dlp"), ffmpeg);
        let spec = spec_in(dir.path());
        tools.extract(&spec, &CancellationToken::new()).await.unwrap();
        assert!(spec.output.exists());
    }

    #[tokio::test]
    async fn failed_extraction_removes_partial_output() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("chapters")).unwrap();
        let ffmpeg = install_stub(
            dir.path(),
            "ffmpeg",
            r#"for last in "$@"; do :; done
echo "partial" > "$last"
echo "Invalid data found when processing input" >&2
exit 1"#,
        );
        let tools = toolchain(PathBuf::from("yt-dlp"), ffmpeg);
        let spec = spec_in(dir.path());
        let err = tools
            .extract(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::Extraction { index, message, .. } => {
                assert_eq!(index, 1);
                assert!(message.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!spec.output.exists());
    }
}
