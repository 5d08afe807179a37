//! Persistence boundaries used by the cache, the enrollment session and the
//! attendance guard.

use crate::types::{AttendanceRecord, DedupPolicy, StoredFace};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("vector payload must be {expected} bytes, got {actual}")]
    InvalidVector { expected: usize, actual: usize },
    #[error("duplicate attendance record")]
    Duplicate,
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Durable storage of enrolled face vectors.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Every enrolled row, vectors undecoded.
    async fn list_all(&self) -> Result<Vec<StoredFace>, StoreError>;

    /// Persist one sample and return its row id.
    ///
    /// `vector_bytes` must be exactly [`ENCODED_LEN`](crate::vector::ENCODED_LEN)
    /// bytes; anything else fails with [`StoreError::InvalidVector`] before
    /// reaching storage.
    async fn insert(
        &self,
        identity_id: &str,
        source_image_reference: &str,
        vector_bytes: &[u8],
    ) -> Result<String, StoreError>;

    /// Remove every sample for an identity, returning how many were removed.
    async fn delete_identity(&self, identity_id: &str) -> Result<usize, StoreError>;
}

/// The subset of attendance storage the guard relies on.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Whether a record already covers this identity under `policy`.
    ///
    /// `as_of` only matters for [`DedupPolicy::Day`].
    async fn exists(
        &self,
        session_id: &str,
        identity_id: &str,
        policy: DedupPolicy,
        as_of: NaiveDateTime,
    ) -> Result<bool, StoreError>;

    /// Write one record. A store that enforces uniqueness reports a
    /// conflicting row as [`StoreError::Duplicate`].
    async fn insert_record(&self, record: &AttendanceRecord) -> Result<(), StoreError>;

    /// Insert an absence for each roster member with no record in the
    /// session yet. Returns the number of rows inserted.
    async fn bulk_insert_absent(
        &self,
        session_id: &str,
        roster: &[String],
        at: NaiveDateTime,
    ) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StoreError::Duplicate.is_retryable());
        assert!(!StoreError::InvalidVector { expected: 512, actual: 4 }.is_retryable());
    }
}
