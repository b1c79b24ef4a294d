#![forbid(unsafe_code)]

//! Command-line front end: fetches metadata for one URL, downloads the video
//! if it is not already in the working directory, and cuts one file per
//! chapter into the output subdirectory.

use anyhow::{Context, Result, bail};
use autosplit_tools::config::{SegmentFailurePolicy, SettingsOverrides, resolve_settings};
use autosplit_tools::metadata::{Chapter, VideoMetadata, read_chapter_file};
use autosplit_tools::planner::{self, Segment};
use autosplit_tools::{Pipeline, PipelineEvent, RunRequest, RunSummary};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "autosplit",
    version,
    about = "Download a video and split it into one file per chapter without re-encoding"
)]
struct Cli {
    /// Video URL understood by yt-dlp.
    url: String,

    /// Directory holding the metadata, the download and the output folder.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Output folder name inside the working directory.
    #[arg(long, value_name = "NAME")]
    output_subdir: Option<PathBuf>,

    /// Hide formats taller than this many pixels.
    #[arg(long, value_name = "PIXELS")]
    max_height: Option<u32>,

    /// Format id from `--list-formats`; defaults to the best one under the ceiling.
    #[arg(long, value_name = "FORMAT_ID")]
    format: Option<String>,

    /// Print the selectable formats and exit.
    #[arg(long)]
    list_formats: bool,

    /// JSON file whose chapters replace the fetched ones.
    #[arg(long, value_name = "FILE")]
    chapters: Option<PathBuf>,

    /// `continue` to report failed segments at the end, `abort` to stop at the first.
    #[arg(long, value_name = "POLICY")]
    on_segment_failure: Option<SegmentFailurePolicy>,

    /// Always ask yt-dlp for metadata even if an .info.json is present.
    #[arg(long)]
    no_reuse_metadata: bool,

    #[arg(long, value_name = "PATH")]
    yt_dlp: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<PathBuf>,

    /// Settings file read before the process environment.
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            work_dir: self.work_dir.clone(),
            output_subdir: self.output_subdir.clone(),
            max_height: self.max_height,
            yt_dlp: self.yt_dlp.clone(),
            ffmpeg: self.ffmpeg.clone(),
            on_segment_failure: self.on_segment_failure,
            reuse_metadata: self.no_reuse_metadata.then_some(false),
            env_path: self.env_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("autosplit_tools=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = resolve_settings(cli.overrides()).context("loading settings")?;
    if cli.list_formats {
        settings.toolchain.ensure_downloader_available().await?;
    } else {
        settings.toolchain.ensure_available().await?;
    }

    let chapter_override = cli
        .chapters
        .as_deref()
        .map(|path| {
            read_chapter_file(path).with_context(|| format!("reading {}", path.display()))
        })
        .transpose()?;

    println!("===================================");
    println!("Chapter Splitter");
    println!("===================================");
    println!("URL: {}", cli.url);
    println!("Working directory: {}", settings.work_dir.display());
    println!("Output: {}", settings.output_dir().display());
    println!();

    let pipeline = Pipeline::new(settings);
    let printer = tokio::spawn(render_events(pipeline.subscribe()));
    let interrupt = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping...");
                pipeline.cancel();
            }
        })
    };

    let outcome = run(&pipeline, &cli, chapter_override).await;

    interrupt.abort();
    let _ = interrupt.await;
    drop(pipeline);
    let _ = printer.await;

    let Some(summary) = outcome? else {
        return Ok(());
    };
    print_summary(&summary);
    if !summary.is_complete() {
        bail!(
            "{} of {} segments failed",
            summary.failed.len(),
            summary.failed.len() + summary.outputs.len()
        );
    }
    Ok(())
}

async fn run(
    pipeline: &Pipeline,
    cli: &Cli,
    chapter_override: Option<Vec<Chapter>>,
) -> Result<Option<RunSummary>> {
    let metadata = pipeline.fetch(cli.url.clone())?.await??;

    if cli.list_formats {
        print_formats(&metadata);
        return Ok(None);
    }

    let chapters = chapter_override
        .as_deref()
        .unwrap_or(metadata.chapters.as_slice());
    if let Ok(segments) = planner::plan(chapters, metadata.duration) {
        print_chapter_table(&segments);
    }

    let request = RunRequest {
        format_id: cli.format.clone(),
        chapters: chapter_override,
    };
    let summary = pipeline.start(request)?.await??;
    Ok(Some(summary))
}

async fn render_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event {
            PipelineEvent::StateChanged { .. } => {}
            PipelineEvent::MetadataReady {
                title,
                duration,
                chapters,
            } => {
                println!("Title: {title}");
                println!("Duration: {}", format_timestamp(duration));
                println!("Chapters: {}", chapters.len());
                println!();
            }
            PipelineEvent::SourceResolved { path, reused } => {
                let how = if reused { "Using existing file" } else { "Downloaded" };
                println!("{how}: {}", path.display());
            }
            PipelineEvent::DownloadProgress(progress) => {
                println!("Downloading: {} (ETA {})", progress.percent, progress.eta);
            }
            PipelineEvent::SegmentStarted { index, total, title } => {
                println!("[{index}/{total}] {title}");
            }
            PipelineEvent::SegmentFinished { path, .. } => {
                println!("  -> {}", path.display());
            }
            PipelineEvent::SegmentFailed { message, .. } => {
                eprintln!("  Warning: {message}");
            }
            // The returned error is reported by `main`.
            PipelineEvent::Finished(_) | PipelineEvent::Failed { .. } => {}
        }
    }
}

fn print_formats(metadata: &VideoMetadata) {
    if metadata.formats.is_empty() {
        println!("No video formats under the height limit");
        return;
    }
    println!("{:<10} {:<32} selector", "id", "format");
    for option in &metadata.formats {
        println!(
            "{:<10} {:<32} {}",
            option.format_id,
            option.label(),
            option.selector
        );
    }
}

fn print_chapter_table(segments: &[Segment]) {
    println!("{:>3}  {:>9}  {:>9}  title", "#", "start", "end");
    for segment in segments {
        println!(
            "{:>3}  {:>9}  {:>9}  {}",
            segment.index,
            format_timestamp(segment.start),
            format_timestamp(segment.end()),
            segment.title
        );
    }
    println!();
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("===================================");
    println!("Split complete!");
    println!("===================================");
    println!("Source: {}", summary.source.display());
    println!("Segments written: {}", summary.outputs.len());
    if !summary.failed.is_empty() {
        println!("Segments failed:");
        for failure in &summary.failed {
            println!("  - {:02} {}: {}", failure.index, failure.title, failure.message);
        }
    }
}

/// `m:ss` below an hour, `h:mm:ss` above.
fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}
