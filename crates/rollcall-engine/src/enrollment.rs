//! Enrollment: capture a target number of face samples for one identity.
//!
//! Frames are read and analysed on a dedicated capture thread. Each accepted
//! candidate is handed to the async side over a one-slot channel, persisted
//! individually, and announced to the cache owner with one [`CacheRefresh`].

use crate::SharedAnalyzer;
use rollcall_core::{EnrollmentStore, FeatureVector, Frame, FrameSource, StoreError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default gap between two accepted samples.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Idle,
    Capturing,
    Completed,
    Aborted,
}

/// Stage of a single frame attempt inside `Capturing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Detecting,
    Extracting,
    Validating,
    Persisting,
}

/// Why a frame did not become a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Dark,
    TooSoon,
    AnalyzerError,
    NoFace,
    MultipleFaces,
    NoUsableVector,
    PersistFailed,
}

impl Rejection {
    pub fn phase(&self) -> AttemptPhase {
        match self {
            Self::Dark | Self::TooSoon | Self::NoFace | Self::MultipleFaces => {
                AttemptPhase::Detecting
            }
            Self::AnalyzerError => AttemptPhase::Extracting,
            Self::NoUsableVector => AttemptPhase::Validating,
            Self::PersistFailed => AttemptPhase::Persisting,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectionCounts {
    pub dark: usize,
    pub too_soon: usize,
    pub analyzer_errors: usize,
    pub no_face: usize,
    pub multiple_faces: usize,
    pub no_usable_vector: usize,
    pub persist_failed: usize,
}

impl RejectionCounts {
    fn note(&mut self, rejection: Rejection) {
        let counter = match rejection {
            Rejection::Dark => &mut self.dark,
            Rejection::TooSoon => &mut self.too_soon,
            Rejection::AnalyzerError => &mut self.analyzer_errors,
            Rejection::NoFace => &mut self.no_face,
            Rejection::MultipleFaces => &mut self.multiple_faces,
            Rejection::NoUsableVector => &mut self.no_usable_vector,
            Rejection::PersistFailed => &mut self.persist_failed,
        };
        *counter += 1;
    }

    pub fn total(&self) -> usize {
        self.dark
            + self.too_soon
            + self.analyzer_errors
            + self.no_face
            + self.multiple_faces
            + self.no_usable_vector
            + self.persist_failed
    }
}

/// Cooperative cancellation flag shared with the capture thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sent once per successfully persisted sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRefresh {
    pub identity_id: String,
    pub row_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    SourceExhausted,
    Cancelled,
    SourceFailed(String),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceExhausted => f.write_str("frame source exhausted"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::SourceFailed(e) => write!(f, "frame source failed: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentReport {
    pub identity_id: String,
    /// Persisted samples, in capture order.
    pub samples: Vec<FeatureVector>,
    /// Row ids returned by the store, parallel to `samples`.
    pub row_ids: Vec<String>,
    pub rejections: RejectionCounts,
    pub frames_seen: usize,
    pub state: EnrollmentState,
}

impl EnrollmentReport {
    pub fn persisted(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("invalid enrollment request: {0}")]
    InvalidRequest(&'static str),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("enrollment aborted after {persisted} of {target} samples: {reason}")]
    Aborted {
        persisted: usize,
        target: usize,
        reason: AbortReason,
        report: Box<EnrollmentReport>,
    },
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode sample image: {0}")]
    Image(#[from] image::ImageError),
    #[error("frame buffer does not match {width}x{height}")]
    Dimensions { width: u32, height: u32 },
}

/// Directory where accepted enrollment frames are kept as PNG files.
#[derive(Debug, Clone)]
pub struct SampleArchive {
    dir: PathBuf,
}

impl SampleArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{identity}_{n}_{unix_ts}.png` inside the archive directory.
    pub fn path_for(&self, identity_id: &str, n: usize, unix_ts: i64) -> PathBuf {
        let safe: String = identity_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}_{n}_{unix_ts}.png"))
    }

    /// Write `frame` as sample number `n`; blocking.
    pub fn write(&self, identity_id: &str, n: usize, frame: Frame) -> Result<PathBuf, ArchiveError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(identity_id, n, chrono::Local::now().timestamp());
        let (width, height) = (frame.width, frame.height);
        let img = image::GrayImage::from_raw(width, height, frame.data)
            .ok_or(ArchiveError::Dimensions { width, height })?;
        img.save(&path)?;
        Ok(path)
    }
}

/// One frame that passed every capture-side check.
struct Candidate {
    frame: Frame,
    vector: FeatureVector,
}

enum CaptureEnd {
    Exhausted,
    Cancelled,
    ReceiverGone,
    Failed(String),
}

struct CaptureOutcome {
    frames_seen: usize,
    rejections: RejectionCounts,
    end: CaptureEnd,
}

/// A single enrollment run for one identity.
pub struct EnrollmentSession {
    identity_id: String,
    target: usize,
    min_interval: Duration,
    archive: Option<SampleArchive>,
    state: EnrollmentState,
}

impl EnrollmentSession {
    pub fn new(identity_id: impl Into<String>, target: usize) -> Self {
        Self {
            identity_id: identity_id.into(),
            target,
            min_interval: DEFAULT_MIN_INTERVAL,
            archive: None,
            state: EnrollmentState::Idle,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_archive(mut self, archive: SampleArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    /// Capture until `target` samples are persisted or capture ends.
    ///
    /// The source is consumed and released before this returns. Falling
    /// short of the target yields [`EnrollmentError::Aborted`] carrying the
    /// number of samples that were persisted anyway.
    pub async fn capture_samples(
        &mut self,
        source: Box<dyn FrameSource>,
        analyzer: SharedAnalyzer,
        store: Arc<dyn EnrollmentStore>,
        refresh: mpsc::UnboundedSender<CacheRefresh>,
        cancel: CancelToken,
    ) -> Result<EnrollmentReport, EnrollmentError> {
        if self.state != EnrollmentState::Idle {
            return Err(EnrollmentError::InvalidRequest("session already used"));
        }
        if self.identity_id.trim().is_empty() {
            return Err(EnrollmentError::InvalidRequest("identity id is empty"));
        }
        if self.target == 0 {
            return Err(EnrollmentError::InvalidRequest("target sample count must be positive"));
        }

        let (tx, mut rx) = mpsc::channel::<Candidate>(1);
        let thread_cancel = cancel.clone();
        let min_interval = self.min_interval;
        let handle = std::thread::Builder::new()
            .name("rollcall-enroll".into())
            .spawn(move || run_capture(source, analyzer, min_interval, thread_cancel, tx))
            .map_err(EnrollmentError::Spawn)?;

        self.state = EnrollmentState::Capturing;
        tracing::info!(
            identity = %self.identity_id,
            target = self.target,
            min_interval_ms = min_interval.as_millis() as u64,
            "enrollment started"
        );

        let mut samples = Vec::with_capacity(self.target);
        let mut row_ids = Vec::with_capacity(self.target);
        let mut persist_rejections = RejectionCounts::default();

        // Cancellation is observed by the capture thread; whatever it already
        // handed off is still persisted before the channel drains.
        while let Some(candidate) = rx.recv().await {
            let n = samples.len() + 1;
            let vector = candidate.vector.clone();
            match self.persist(store.as_ref(), candidate, n).await {
                Ok(row_id) => {
                    tracing::debug!(identity = %self.identity_id, sample = n, row_id = %row_id, "sample persisted");
                    let signal = CacheRefresh {
                        identity_id: self.identity_id.clone(),
                        row_id: row_id.clone(),
                    };
                    if refresh.send(signal).is_err() {
                        tracing::warn!(
                            identity = %self.identity_id,
                            row_id = %row_id,
                            "cache refresh receiver gone; cache will not reflect this sample until the next reload"
                        );
                    }
                    samples.push(vector);
                    row_ids.push(row_id);
                }
                Err(e) => {
                    persist_rejections.note(Rejection::PersistFailed);
                    tracing::warn!(
                        identity = %self.identity_id,
                        sample = n,
                        phase = ?Rejection::PersistFailed.phase(),
                        error = %e,
                        "failed to persist enrollment sample; continuing"
                    );
                }
            }
            if samples.len() >= self.target {
                break;
            }
        }
        drop(rx);

        let outcome = match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(outcome)) => outcome,
            _ => CaptureOutcome {
                frames_seen: 0,
                rejections: RejectionCounts::default(),
                end: CaptureEnd::Failed("capture thread panicked".into()),
            },
        };

        let mut rejections = outcome.rejections;
        rejections.persist_failed += persist_rejections.persist_failed;
        let completed = samples.len() >= self.target;
        self.state = if completed {
            EnrollmentState::Completed
        } else {
            EnrollmentState::Aborted
        };
        let report = EnrollmentReport {
            identity_id: self.identity_id.clone(),
            samples,
            row_ids,
            rejections,
            frames_seen: outcome.frames_seen,
            state: self.state,
        };

        if completed {
            tracing::info!(
                identity = %self.identity_id,
                persisted = report.persisted(),
                frames = report.frames_seen,
                rejected = rejections.total(),
                "enrollment completed"
            );
            return Ok(report);
        }

        let reason = if cancel.is_cancelled() {
            AbortReason::Cancelled
        } else {
            match outcome.end {
                CaptureEnd::Failed(e) => AbortReason::SourceFailed(e),
                CaptureEnd::Cancelled => AbortReason::Cancelled,
                CaptureEnd::Exhausted | CaptureEnd::ReceiverGone => AbortReason::SourceExhausted,
            }
        };
        tracing::warn!(
            identity = %self.identity_id,
            persisted = report.persisted(),
            target = self.target,
            reason = %reason,
            "enrollment aborted"
        );
        Err(EnrollmentError::Aborted {
            persisted: report.persisted(),
            target: self.target,
            reason,
            report: Box::new(report),
        })
    }

    async fn persist(
        &self,
        store: &dyn EnrollmentStore,
        candidate: Candidate,
        n: usize,
    ) -> Result<String, StoreError> {
        let sequence = candidate.frame.sequence;
        let archived = match &self.archive {
            Some(archive) => self.archive_frame(archive, candidate.frame, n).await,
            None => None,
        };
        let reference = match &archived {
            Some(path) => path.display().to_string(),
            None => format!("frame:{sequence}"),
        };

        let result = store
            .insert(&self.identity_id, &reference, &candidate.vector.to_bytes())
            .await;
        if result.is_err() {
            if let Some(path) = archived {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove orphaned sample image");
                }
            }
        }
        result
    }

    async fn archive_frame(&self, archive: &SampleArchive, frame: Frame, n: usize) -> Option<PathBuf> {
        let archive = archive.clone();
        let identity = self.identity_id.clone();
        let written = tokio::task::spawn_blocking(move || archive.write(&identity, n, frame)).await;
        match written {
            Ok(Ok(path)) => Some(path),
            Ok(Err(e)) => {
                tracing::warn!(identity = %self.identity_id, sample = n, error = %e, "failed to archive sample image");
                None
            }
            Err(e) => {
                tracing::warn!(identity = %self.identity_id, sample = n, error = %e, "sample archive task failed");
                None
            }
        }
    }
}

/// Capture-thread body. Blocking.
fn run_capture(
    mut source: Box<dyn FrameSource>,
    analyzer: SharedAnalyzer,
    min_interval: Duration,
    cancel: CancelToken,
    tx: mpsc::Sender<Candidate>,
) -> CaptureOutcome {
    let mut frames_seen = 0usize;
    let mut rejections = RejectionCounts::default();
    let mut last_accepted: Option<Instant> = None;

    let end = loop {
        if cancel.is_cancelled() {
            break CaptureEnd::Cancelled;
        }
        if tx.is_closed() {
            break CaptureEnd::ReceiverGone;
        }
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break CaptureEnd::Exhausted,
            Err(e) => break CaptureEnd::Failed(e.to_string()),
        };
        frames_seen += 1;

        let vector = match screen_frame(&frame, &analyzer, min_interval, last_accepted) {
            Ok(vector) => vector,
            Err(rejection) => {
                rejections.note(rejection);
                tracing::debug!(
                    sequence = frame.sequence,
                    reason = ?rejection,
                    phase = ?rejection.phase(),
                    "enrollment frame rejected"
                );
                continue;
            }
        };

        last_accepted = Some(frame.timestamp);
        if tx.blocking_send(Candidate { frame, vector }).is_err() {
            break CaptureEnd::ReceiverGone;
        }
    };

    source.release();
    tracing::debug!(frames_seen, "enrollment capture thread exiting");
    CaptureOutcome {
        frames_seen,
        rejections,
        end,
    }
}

fn screen_frame(
    frame: &Frame,
    analyzer: &SharedAnalyzer,
    min_interval: Duration,
    last_accepted: Option<Instant>,
) -> Result<FeatureVector, Rejection> {
    if frame.is_dark() {
        return Err(Rejection::Dark);
    }
    if let Some(last) = last_accepted {
        if frame.timestamp.saturating_duration_since(last) < min_interval {
            return Err(Rejection::TooSoon);
        }
    }

    let faces = analyzer.lock().analyze(frame).map_err(|e| {
        tracing::debug!(sequence = frame.sequence, error = %e, "face analyzer failed");
        Rejection::AnalyzerError
    })?;
    let face = match faces.as_slice() {
        [] => return Err(Rejection::NoFace),
        [face] => face,
        _ => return Err(Rejection::MultipleFaces),
    };
    face.feature_vector().ok_or(Rejection::NoUsableVector)
}
