//! Frames and the two external collaborators that produce and analyse them.
//!
//! Camera control and the feature extractor live outside this workspace;
//! both are reached through [`FrameSource`] and [`FaceAnalyzer`].

use crate::vector::FeatureVector;
use std::time::Instant;

/// Fraction of near-black pixels above which a frame is treated as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_THRESHOLD)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Returns true if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Face location in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// One face found by the analyzer.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    /// Raw extractor output, if extraction produced anything for this region.
    pub encoding: Option<Vec<f32>>,
}

impl DetectedFace {
    /// The extractor output as a feature vector; `None` unless it has exactly 128 values.
    pub fn feature_vector(&self) -> Option<FeatureVector> {
        self.encoding
            .as_deref()
            .and_then(|values| FeatureVector::from_slice(values).ok())
    }
}

/// Error reported by an external collaborator.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

/// Producer of camera frames. Blocking; runs on the capture thread.
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, CollaboratorError>;

    /// Release the underlying device. Called once when a loop or session ends.
    fn release(&mut self) {}
}

/// Face detection plus feature extraction.
pub trait FaceAnalyzer: Send {
    /// Detect faces in `frame` and extract a candidate encoding for each one.
    fn analyze(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::FEATURE_DIM;

    fn face(encoding: Option<Vec<f32>>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 },
            encoding,
        }
    }

    #[test]
    fn test_dark_frame_all_black() {
        let gray = vec![0u8; 1000];
        assert!(is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_normal() {
        let gray = vec![128u8; 1000];
        assert!(!is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_frame_is_dark_uses_default_threshold() {
        let frame = |fill: u8| Frame {
            data: vec![fill; 64],
            width: 8,
            height: 8,
            timestamp: std::time::Instant::now(),
            sequence: 1,
        };
        assert!(frame(5).is_dark());
        assert!(!frame(200).is_dark());
    }

    #[test]
    fn test_feature_vector_requires_exact_length() {
        assert!(face(Some(vec![0.1; FEATURE_DIM])).feature_vector().is_some());
        assert!(face(Some(vec![0.1; FEATURE_DIM + 1])).feature_vector().is_none());
        assert!(face(Some(vec![])).feature_vector().is_none());
        assert!(face(None).feature_vector().is_none());
    }
}
