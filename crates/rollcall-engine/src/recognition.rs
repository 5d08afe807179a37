//! Live recognition: frames in, one match event per detected face out.
//!
//! The loop runs on its own OS thread and only reads the cache snapshot.
//! It never writes attendance; committing a match is the caller's job.

use crate::SharedAnalyzer;
use rollcall_core::{
    BoundingBox, FrameSource, KnownFaceCache, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Confidence above which a match is offered for confirmation.
pub const DEFAULT_CONFIRM_CONFIDENCE: f32 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub threshold: f32,
    pub confirm_confidence: f32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            confirm_confidence: DEFAULT_CONFIRM_CONFIDENCE,
        }
    }
}

/// One detected face in one frame, with its match outcome.
#[derive(Debug, Clone)]
pub struct RecognitionEvent {
    pub frame_sequence: u32,
    pub captured_at: Instant,
    /// Position of the face in the analyzer's output for this frame.
    pub face_index: usize,
    pub bbox: BoundingBox,
    pub result: MatchResult,
    /// Matched with confidence strictly above the confirmation bar.
    pub confirmable: bool,
    /// Generation of the cache snapshot the face was matched against.
    pub cache_generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    SourceExhausted,
    SinkClosed,
    SourceFailed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub dark_frames: u64,
    pub analyzer_errors: u64,
    pub faces: u64,
    pub matched: u64,
    pub events_sent: u64,
    /// Events discarded because the sink was full.
    pub events_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub exit: LoopExit,
    pub stats: LoopStats,
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture thread panicked")]
    Panicked,
}

/// Handle to a running recognition loop.
pub struct RecognitionLoop {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<LoopReport>,
}

impl RecognitionLoop {
    /// Start the loop on a thread named `rollcall-capture`.
    ///
    /// Events go to `sink` with `try_send`; a full sink drops the event
    /// rather than stalling capture.
    pub fn spawn<M>(
        source: Box<dyn FrameSource>,
        analyzer: SharedAnalyzer,
        cache: Arc<KnownFaceCache>,
        matcher: M,
        settings: LoopSettings,
        sink: mpsc::Sender<RecognitionEvent>,
    ) -> Result<Self, RecognitionError>
    where
        M: Matcher + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || {
                run_loop(source, analyzer, cache, matcher, settings, sink, thread_stop)
            })
            .map_err(RecognitionError::Spawn)?;
        Ok(Self { stop, handle })
    }

    /// Ask the loop to exit after the frame in flight.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop thread. Blocking.
    pub fn join(self) -> Result<LoopReport, RecognitionError> {
        self.handle.join().map_err(|_| RecognitionError::Panicked)
    }

    /// [`join`](Self::join) from async code.
    pub async fn wait(self) -> Result<LoopReport, RecognitionError> {
        tokio::task::spawn_blocking(move || self.join())
            .await
            .map_err(|_| RecognitionError::Panicked)?
    }
}

fn run_loop<M: Matcher>(
    mut source: Box<dyn FrameSource>,
    analyzer: SharedAnalyzer,
    cache: Arc<KnownFaceCache>,
    matcher: M,
    settings: LoopSettings,
    sink: mpsc::Sender<RecognitionEvent>,
    stop: Arc<AtomicBool>,
) -> LoopReport {
    tracing::info!(
        threshold = settings.threshold,
        confirm_confidence = settings.confirm_confidence,
        "recognition loop started"
    );
    let mut stats = LoopStats::default();

    let exit = 'frames: loop {
        if stop.load(Ordering::SeqCst) {
            break LoopExit::Stopped;
        }
        if sink.is_closed() {
            break LoopExit::SinkClosed;
        }
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break LoopExit::SourceExhausted,
            Err(e) => break LoopExit::SourceFailed(e.to_string()),
        };
        stats.frames += 1;

        if frame.is_dark() {
            stats.dark_frames += 1;
            continue;
        }
        let faces = match analyzer.lock().analyze(&frame) {
            Ok(faces) => faces,
            Err(e) => {
                stats.analyzer_errors += 1;
                tracing::debug!(sequence = frame.sequence, error = %e, "face analyzer failed");
                continue;
            }
        };

        let snapshot = cache.current();
        for (face_index, face) in faces.iter().enumerate() {
            stats.faces += 1;
            let result = match face.feature_vector() {
                Some(probe) => matcher.compare(&probe, &snapshot, settings.threshold),
                None => MatchResult::unmatched(None),
            };
            if result.matched {
                stats.matched += 1;
            }
            let confirmable = result.matched && result.confidence > settings.confirm_confidence;
            let event = RecognitionEvent {
                frame_sequence: frame.sequence,
                captured_at: frame.timestamp,
                face_index,
                bbox: face.bbox,
                result,
                confirmable,
                cache_generation: snapshot.generation(),
            };
            match sink.try_send(event) {
                Ok(()) => stats.events_sent += 1,
                Err(TrySendError::Full(_)) => {
                    stats.events_dropped += 1;
                    tracing::debug!(sequence = frame.sequence, face_index, "event sink full; dropping event");
                }
                Err(TrySendError::Closed(_)) => break 'frames LoopExit::SinkClosed,
            }
        }
    };

    source.release();
    tracing::info!(
        exit = ?exit,
        frames = stats.frames,
        faces = stats.faces,
        matched = stats.matched,
        dropped = stats.events_dropped,
        "recognition loop exited"
    );
    LoopReport { exit, stats }
}
