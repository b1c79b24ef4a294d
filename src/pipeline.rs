#![forbid(unsafe_code)]

//! Orchestrates fetch, resolve, download and split as an explicit state
//! machine.
//!
//! Each phase runs on its own spawned task. Front ends never poll: they
//! subscribe to [`PipelineEvent`]s and render them. At most one task is in
//! flight per [`Pipeline`]; a second request while one runs is rejected.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SegmentFailurePolicy, Settings};
use crate::error::{PipelineError, Result};
use crate::extract::ExtractionSpec;
use crate::metadata::{self, Chapter, MetadataError, VideoMetadata};
use crate::planner::{self, Segment};
use crate::progress::ProgressEvent;
use crate::resolver::{self, ResolveError, ResolvedFile};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    FetchingMetadata,
    MetadataReady,
    Resolving,
    Downloading,
    Splitting,
    Done,
    Error,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingMetadata => "fetching metadata",
            Self::MetadataReady => "metadata ready",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Splitting => "splitting",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// True while a background task owns the pipeline.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::FetchingMetadata | Self::Resolving | Self::Downloading | Self::Splitting
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentFailure {
    pub index: usize,
    pub title: String,
    pub message: String,
}

/// Outcome of a split run that reached `Done`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub source: PathBuf,
    /// False when an existing local file was reused.
    pub downloaded: bool,
    pub outputs: Vec<PathBuf>,
    pub failed: Vec<SegmentFailure>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    MetadataReady {
        title: String,
        duration: f64,
        chapters: Vec<Chapter>,
    },
    SourceResolved {
        path: PathBuf,
        reused: bool,
    },
    DownloadProgress(ProgressEvent),
    SegmentStarted {
        index: usize,
        total: usize,
        title: String,
    },
    SegmentFinished {
        index: usize,
        path: PathBuf,
    },
    SegmentFailed {
        index: usize,
        title: String,
        message: String,
    },
    Finished(RunSummary),
    Failed {
        message: String,
        cancelled: bool,
    },
}

/// Parameters of a split run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Format id picked from the metadata's format list; `None` selects the
    /// best encoding under the height ceiling.
    pub format_id: Option<String>,
    /// Replacement chapter list. `None` keeps the fetched chapters.
    pub chapters: Option<Vec<Chapter>>,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    settings: Settings,
    run: Mutex<RunState>,
    events: broadcast::Sender<PipelineEvent>,
}

struct RunState {
    state: PipelineState,
    url: Option<String>,
    metadata: Option<Arc<VideoMetadata>>,
    cancel: Option<CancellationToken>,
    last_error: Option<String>,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PipelineInner {
                settings,
                run: Mutex::new(RunState {
                    state: PipelineState::Idle,
                    url: None,
                    metadata: None,
                    cancel: None,
                    last_error: None,
                }),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.inner.run.lock().state
    }

    pub fn metadata(&self) -> Option<Arc<VideoMetadata>> {
        self.inner.run.lock().metadata.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.run.lock().last_error.clone()
    }

    /// Fetches metadata for `url` in the background. Metadata from an
    /// earlier fetch is dropped as soon as the new fetch begins.
    pub fn fetch(&self, url: impl Into<String>) -> Result<JoinHandle<Result<Arc<VideoMetadata>>>> {
        let url = url.into();
        let (cancel, ()) =
            self.inner
                .begin(PipelineState::FetchingMetadata, "fetch metadata", |_| Ok(()))?;
        {
            // A run must never start against an earlier URL's document.
            let mut run = self.inner.run.lock();
            run.url = None;
            run.metadata = None;
        }

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let result = inner.fetch_metadata(&url, &cancel).await;
            match &result {
                Ok(metadata) => {
                    {
                        let mut run = inner.run.lock();
                        run.url = Some(url);
                        run.metadata = Some(metadata.clone());
                        run.cancel = None;
                    }
                    inner.transition(PipelineState::MetadataReady);
                    inner.emit(PipelineEvent::MetadataReady {
                        title: metadata.title.clone(),
                        duration: metadata.duration,
                        chapters: metadata.chapters.clone(),
                    });
                }
                Err(err) => inner.fail(err),
            }
            result
        }))
    }

    /// Starts a split run on the current metadata.
    pub fn start(&self, request: RunRequest) -> Result<JoinHandle<Result<RunSummary>>> {
        let (cancel, (url, metadata)) =
            self.inner
                .begin(PipelineState::Resolving, "start a run", |run| {
                    match (&run.url, &run.metadata) {
                        (Some(url), Some(metadata)) => Ok((url.clone(), metadata.clone())),
                        _ => Err(PipelineError::InvalidState {
                            action: "start a run",
                            state: format!("{} without metadata", run.state),
                        }),
                    }
                })?;

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let result = inner.split(&url, &metadata, request, &cancel).await;
            match &result {
                Ok(summary) => {
                    inner.run.lock().cancel = None;
                    inner.transition(PipelineState::Done);
                    inner.emit(PipelineEvent::Finished(summary.clone()));
                }
                Err(err) => inner.fail(err),
            }
            result
        }))
    }

    /// Asks the running task to stop. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        match self.inner.run.lock().cancel.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl PipelineInner {
    /// Moves into the first state of a task after checking the pipeline is
    /// free. `check` sees the state under the same lock.
    fn begin<T>(
        &self,
        to: PipelineState,
        action: &'static str,
        check: impl FnOnce(&RunState) -> Result<T>,
    ) -> Result<(CancellationToken, T)> {
        let token = CancellationToken::new();
        let (from, checked) = {
            let mut run = self.run.lock();
            if run.state.is_busy() {
                return Err(PipelineError::Busy {
                    active: if run.state == PipelineState::FetchingMetadata {
                        "metadata fetch"
                    } else {
                        "split run"
                    },
                });
            }
            let checked = check(&*run)?;
            let from = run.state;
            run.state = to;
            run.cancel = Some(token.clone());
            run.last_error = None;
            (from, checked)
        };
        debug!(action, %from, %to, "task started");
        self.emit(PipelineEvent::StateChanged { from, to });
        Ok((token, checked))
    }

    fn transition(&self, to: PipelineState) {
        let from = {
            let mut run = self.run.lock();
            std::mem::replace(&mut run.state, to)
        };
        if from != to {
            info!(%from, %to, "state changed");
            self.emit(PipelineEvent::StateChanged { from, to });
        }
    }

    fn fail(&self, err: &PipelineError) {
        let message = err.to_string();
        warn!(error = %message, "task failed");
        {
            let mut run = self.run.lock();
            run.cancel = None;
            run.last_error = Some(message.clone());
        }
        self.transition(PipelineState::Error);
        self.emit(PipelineEvent::Failed {
            message,
            cancelled: err.is_cancelled(),
        });
    }

    fn emit(&self, event: PipelineEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<VideoMetadata>> {
        let settings = &self.settings;
        tokio::fs::create_dir_all(&settings.work_dir).await?;

        if settings.reuse_metadata
            && let Some((cached, metadata)) =
                metadata::find_cached_metadata(&settings.work_dir, url, settings.max_height)?
        {
            info!(path = %cached.display(), "using existing metadata");
            return Ok(Arc::new(metadata));
        }

        let raw = settings
            .toolchain
            .fetch_metadata(url, &settings.work_dir, cancel)
            .await?;
        let metadata = VideoMetadata::from_json(&raw, settings.max_height).map_err(|err| match err {
            MetadataError::Malformed(source) => PipelineError::MetadataFetch {
                url: url.to_string(),
                message: format!("unreadable response: {source}"),
            },
            other => PipelineError::MetadataValidation(other),
        })?;

        let cache_path = settings.work_dir.join(metadata.cache_file_name());
        if let Err(err) = tokio::fs::write(&cache_path, &raw).await {
            warn!(path = %cache_path.display(), error = %err, "could not cache metadata");
        }
        info!(
            title = %metadata.title,
            chapters = metadata.chapters.len(),
            formats = metadata.formats.len(),
            "metadata ready"
        );
        Ok(Arc::new(metadata))
    }

    async fn split(
        &self,
        url: &str,
        metadata: &VideoMetadata,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let settings = &self.settings;
        let chapters = request
            .chapters
            .as_deref()
            .unwrap_or(metadata.chapters.as_slice());
        let segments = planner::plan(chapters, metadata.duration)?;
        debug!(segments = segments.len(), "planned segments");

        let selector = metadata.selector_for(request.format_id.as_deref(), settings.max_height);
        let expected = settings
            .toolchain
            .predict_filename(url, &selector, &settings.work_dir, cancel)
            .await?;

        let (source, downloaded) =
            match resolver::resolve(expected.as_deref(), Some(&metadata.title), &settings.work_dir) {
                Ok(found) => (found, false),
                Err(ResolveError::NotFound { .. }) => {
                    self.transition(PipelineState::Downloading);
                    let events = self.events.clone();
                    settings
                        .toolchain
                        .download(url, &selector, &settings.work_dir, cancel, |progress| {
                            let _ = events.send(PipelineEvent::DownloadProgress(progress));
                        })
                        .await?;
                    let found = resolver::resolve(
                        expected.as_deref(),
                        Some(&metadata.title),
                        &settings.work_dir,
                    )?;
                    (found, true)
                }
                Err(err) => return Err(err.into()),
            };
        info!(path = %source.path.display(), downloaded, "source resolved");
        self.emit(PipelineEvent::SourceResolved {
            path: source.path.clone(),
            reused: !downloaded,
        });

        self.transition(PipelineState::Splitting);
        let output_dir = settings.output_dir();
        tokio::fs::create_dir_all(&output_dir).await?;
        let (outputs, failed) = self.extract_all(&source, &segments, &output_dir, cancel).await?;

        Ok(RunSummary {
            source: source.path,
            downloaded,
            outputs,
            failed,
        })
    }

    async fn extract_all(
        &self,
        source: &ResolvedFile,
        segments: &[Segment],
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(Vec<PathBuf>, Vec<SegmentFailure>)> {
        let total = segments.len();
        let mut outputs = Vec::with_capacity(total);
        let mut failed = Vec::new();

        for segment in segments {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    phase: PipelineState::Splitting.as_str().into(),
                });
            }
            self.emit(PipelineEvent::SegmentStarted {
                index: segment.index,
                total,
                title: segment.title.clone(),
            });

            let spec = ExtractionSpec::build(source, segment, output_dir);
            match self.settings.toolchain.extract(&spec, cancel).await {
                Ok(()) => {
                    info!(index = segment.index, path = %spec.output.display(), "segment written");
                    self.emit(PipelineEvent::SegmentFinished {
                        index: segment.index,
                        path: spec.output.clone(),
                    });
                    outputs.push(spec.output);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    let message = err.to_string();
                    warn!(index = segment.index, error = %message, "segment failed");
                    self.emit(PipelineEvent::SegmentFailed {
                        index: segment.index,
                        title: segment.title.clone(),
                        message: message.clone(),
                    });
                    if self.settings.on_segment_failure == SegmentFailurePolicy::Abort {
                        return Err(err);
                    }
                    failed.push(SegmentFailure {
                        index: segment.index,
                        title: segment.title.clone(),
                        message,
                    });
                }
            }
        }

        Ok((outputs, failed))
    }
}
