use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// An enrollment row as persisted, with the vector still in its encoded form.
///
/// Decoding is left to the cache so that one corrupt blob costs one row,
/// not the whole listing.
#[derive(Debug, Clone)]
pub struct StoredFace {
    pub id: String,
    pub identity_id: String,
    pub source_image_reference: String,
    pub vector_bytes: Vec<u8>,
}

/// Result of matching a probe vector against a cache snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Identity of the nearest enrolled vector, only set on a match.
    pub identity_id: Option<String>,
    /// `(1 - distance) * 100`, rounded to two decimals, in [0, 100]. Zero when unmatched.
    pub confidence: f32,
    /// Distance to the nearest enrolled vector, `None` for an empty cache.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unmatched(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            identity_id: None,
            confidence: 0.0,
            distance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "present" => Ok(Self::Present),
            "late" => Ok(Self::Late),
            "absent" => Ok(Self::Absent),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// Scope within which a second record for the same identity is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupPolicy {
    /// One record per `(session_id, identity_id)`, regardless of status.
    #[default]
    #[serde(alias = "per_session")]
    Session,
    /// One record per identity per calendar day, across sessions.
    #[serde(alias = "per_day")]
    Day,
}

impl std::str::FromStr for DedupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" | "per_session" | "per-session" => Ok(Self::Session),
            "day" | "per_day" | "per-day" => Ok(Self::Day),
            other => Err(format!("unknown dedup policy: {other}")),
        }
    }
}

/// A single attendance event. Written once, never updated by this core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub session_id: String,
    pub identity_id: String,
    /// Local wall-clock time; its date is the calendar day used by [`DedupPolicy::Day`].
    pub timestamp: NaiveDateTime,
    pub status: AttendanceStatus,
}
