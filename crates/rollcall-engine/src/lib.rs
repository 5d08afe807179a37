//! rollcall-engine: enrollment and live recognition on top of the face cache.
//!
//! [`Engine`] is the embedding entry point. It owns the face cache and keeps
//! it current after enrollment writes; confirmations go through the
//! [`AttendanceGuard`]. The pieces are usable on their own as well.

pub mod config;
pub mod engine;
pub mod enrollment;
pub mod guard;
pub mod recognition;

#[cfg(test)]
mod testing;

use rollcall_core::FaceAnalyzer;
use std::sync::Arc;

/// Analyzer shared between the recognition loop and enrollment sessions.
pub type SharedAnalyzer = Arc<parking_lot::Mutex<dyn FaceAnalyzer>>;

pub use config::{Config, ConfigError};
pub use engine::{local_now, Engine};
pub use enrollment::{
    AbortReason, CacheRefresh, CancelToken, EnrollmentError, EnrollmentReport, EnrollmentSession,
    EnrollmentState, RejectionCounts, SampleArchive,
};
pub use guard::{AttendanceGuard, RecordOutcome};
pub use recognition::{
    LoopExit, LoopReport, LoopSettings, LoopStats, RecognitionError, RecognitionEvent,
    RecognitionLoop,
};
