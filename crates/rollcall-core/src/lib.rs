//! rollcall-core: feature vectors and the known-face cache they are matched against.
//!
//! Nothing in this crate touches a database or a camera: storage sits behind
//! the traits in [`store`], frames and feature extraction behind the traits in
//! [`frame`].

pub mod cache;
pub mod frame;
pub mod matcher;
pub mod store;
pub mod types;
pub mod vector;

pub use cache::{CacheSnapshot, KnownFaceCache};
pub use frame::{
    BoundingBox, CollaboratorError, DetectedFace, FaceAnalyzer, Frame, FrameSource,
};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use store::{AttendanceStore, EnrollmentStore, StoreError};
pub use types::{AttendanceRecord, AttendanceStatus, DedupPolicy, MatchResult, StoredFace};
pub use vector::{FeatureVector, VectorError, ENCODED_LEN, FEATURE_DIM};
