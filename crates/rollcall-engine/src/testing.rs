//! Scripted collaborators shared by the engine tests.

use crate::SharedAnalyzer;
use async_trait::async_trait;
use parking_lot::Mutex;
use rollcall_core::{
    BoundingBox, CollaboratorError, DetectedFace, EnrollmentStore, FaceAnalyzer, Frame,
    FrameSource, StoreError, StoredFace, ENCODED_LEN, FEATURE_DIM,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) fn bright_frame(sequence: u32, timestamp: Instant) -> Frame {
    Frame {
        data: vec![128u8; 16],
        width: 4,
        height: 4,
        timestamp,
        sequence,
    }
}

pub(crate) fn dark_frame(sequence: u32, timestamp: Instant) -> Frame {
    Frame {
        data: vec![0u8; 16],
        ..bright_frame(sequence, timestamp)
    }
}

/// Frames numbered from 1, `spacing` apart.
pub(crate) fn frames(count: u32, spacing: Duration) -> Vec<Frame> {
    let base = Instant::now();
    (1..=count)
        .map(|seq| bright_frame(seq, base + spacing * seq))
        .collect()
}

pub(crate) fn face(encoding: Option<Vec<f32>>) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox {
            x: 1.0,
            y: 1.0,
            width: 2.0,
            height: 2.0,
            confidence: 0.9,
        },
        encoding,
    }
}

pub(crate) fn encoding(value: f32) -> Vec<f32> {
    vec![value; FEATURE_DIM]
}

pub(crate) struct ScriptedSource {
    frames: VecDeque<Frame>,
    endless: bool,
    next_sequence: u32,
    fail_with: Option<String>,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub(crate) fn new(frames: Vec<Frame>) -> (Self, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let next_sequence = frames.iter().map(|f| f.sequence).max().unwrap_or(0) + 1;
        let source = Self {
            frames: frames.into(),
            endless: false,
            next_sequence,
            fail_with: None,
            released: Arc::clone(&released),
        };
        (source, released)
    }

    /// Keeps producing bright frames roughly every millisecond.
    pub(crate) fn endless() -> (Self, Arc<AtomicBool>) {
        let (mut source, released) = Self::new(Vec::new());
        source.endless = true;
        (source, released)
    }

    /// Fail with `message` once the scripted frames run out.
    pub(crate) fn failing_after(frames: Vec<Frame>, message: &str) -> (Self, Arc<AtomicBool>) {
        let (mut source, released) = Self::new(frames);
        source.fail_with = Some(message.to_string());
        (source, released)
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CollaboratorError> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }
        if self.endless {
            std::thread::sleep(Duration::from_millis(1));
            let frame = bright_frame(self.next_sequence, Instant::now());
            self.next_sequence += 1;
            return Ok(Some(frame));
        }
        match self.fail_with.take() {
            Some(message) => Err(CollaboratorError(message)),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct FnAnalyzer<F>(F);

impl<F> FaceAnalyzer for FnAnalyzer<F>
where
    F: FnMut(&Frame) -> Result<Vec<DetectedFace>, CollaboratorError> + Send,
{
    fn analyze(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, CollaboratorError> {
        (self.0)(frame)
    }
}

pub(crate) fn analyzer<F>(f: F) -> SharedAnalyzer
where
    F: FnMut(&Frame) -> Result<Vec<DetectedFace>, CollaboratorError> + Send + 'static,
{
    Arc::new(Mutex::new(FnAnalyzer(f)))
}

/// Enrollment store kept in memory; can be told to fail upcoming inserts.
#[derive(Default)]
pub(crate) struct MemoryFaces {
    rows: Mutex<Vec<StoredFace>>,
    fail_inserts: AtomicUsize,
}

impl MemoryFaces {
    pub(crate) fn fail_next_inserts(&self, count: usize) {
        self.fail_inserts.store(count, Ordering::SeqCst);
    }

    pub(crate) fn rows(&self) -> Vec<StoredFace> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl EnrollmentStore for MemoryFaces {
    async fn list_all(&self) -> Result<Vec<StoredFace>, StoreError> {
        Ok(self.rows())
    }

    async fn insert(
        &self,
        identity_id: &str,
        source_image_reference: &str,
        vector_bytes: &[u8],
    ) -> Result<String, StoreError> {
        let pending = self.fail_inserts.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_inserts.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("disk I/O error".into()));
        }
        if vector_bytes.len() != ENCODED_LEN {
            return Err(StoreError::InvalidVector {
                expected: ENCODED_LEN,
                actual: vector_bytes.len(),
            });
        }
        let mut rows = self.rows.lock();
        let id = format!("face-{}", rows.len() + 1);
        rows.push(StoredFace {
            id: id.clone(),
            identity_id: identity_id.to_string(),
            source_image_reference: source_image_reference.to_string(),
            vector_bytes: vector_bytes.to_vec(),
        });
        Ok(id)
    }

    async fn delete_identity(&self, identity_id: &str) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|r| r.identity_id != identity_id);
        Ok(before - rows.len())
    }
}
