//! Attendance dedup: one record per identity within the configured window.

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rollcall_core::{AttendanceRecord, AttendanceStatus, AttendanceStore, DedupPolicy, StoreError};
use std::collections::HashMap;
use std::sync::Arc;

/// What happened to a confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(AttendanceRecord),
    /// A record already covers this identity; nothing was written.
    AlreadyRecorded,
}

/// Serializes check-then-write per identity in front of an [`AttendanceStore`].
///
/// Locking on the identity alone covers both dedup windows: two confirmations
/// for one person never interleave, whatever session they name.
pub struct AttendanceGuard {
    store: Arc<dyn AttendanceStore>,
    policy: DedupPolicy,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AttendanceGuard {
    pub fn new(store: Arc<dyn AttendanceStore>, policy: DedupPolicy) -> Self {
        Self {
            store,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    /// Whether a new record for this identity would be accepted under `policy`.
    pub async fn should_record(
        &self,
        session_id: &str,
        identity_id: &str,
        as_of: NaiveDateTime,
        policy: DedupPolicy,
    ) -> Result<bool, StoreError> {
        let exists = self.store.exists(session_id, identity_id, policy, as_of).await?;
        Ok(!exists)
    }

    /// Write a record unless the guard's policy says one already exists.
    pub async fn record(
        &self,
        session_id: &str,
        identity_id: &str,
        as_of: NaiveDateTime,
        status: AttendanceStatus,
    ) -> Result<RecordOutcome, StoreError> {
        let outcome = {
            let lease = self.lease(identity_id);
            let _held = lease.lock.lock().await;
            self.check_and_write(session_id, identity_id, as_of, status).await
        };

        match &outcome {
            Ok(RecordOutcome::Recorded(record)) => tracing::info!(
                session = session_id,
                identity = identity_id,
                status = %record.status,
                "attendance recorded"
            ),
            Ok(RecordOutcome::AlreadyRecorded) => tracing::debug!(
                session = session_id,
                identity = identity_id,
                policy = ?self.policy,
                "attendance already recorded"
            ),
            Err(e) => tracing::warn!(
                session = session_id,
                identity = identity_id,
                error = %e,
                retryable = e.is_retryable(),
                "attendance write failed"
            ),
        }
        outcome
    }

    async fn check_and_write(
        &self,
        session_id: &str,
        identity_id: &str,
        as_of: NaiveDateTime,
        status: AttendanceStatus,
    ) -> Result<RecordOutcome, StoreError> {
        if !self.should_record(session_id, identity_id, as_of, self.policy).await? {
            return Ok(RecordOutcome::AlreadyRecorded);
        }

        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            identity_id: identity_id.to_string(),
            timestamp: as_of,
            status,
        };
        match self.store.insert_record(&record).await {
            Ok(()) => Ok(RecordOutcome::Recorded(record)),
            Err(StoreError::Duplicate) => Ok(RecordOutcome::AlreadyRecorded),
            Err(e) => Err(e),
        }
    }

    /// Record an absence for every roster member with nothing in the session yet.
    ///
    /// Safe to re-run: members already covered are left alone.
    pub async fn mark_absent_for_unattended(
        &self,
        session_id: &str,
        roster: &[String],
        as_of: NaiveDateTime,
    ) -> Result<usize, StoreError> {
        let inserted = self.store.bulk_insert_absent(session_id, roster, as_of).await?;
        tracing::info!(
            session = session_id,
            roster = roster.len(),
            inserted,
            "marked unattended roster members absent"
        );
        Ok(inserted)
    }

    fn lease(&self, identity_id: &str) -> KeyLease<'_> {
        let mut locks = self.locks.lock();
        let lock = Arc::clone(locks.entry(identity_id.to_string()).or_default());
        KeyLease {
            guard: self,
            identity_id: identity_id.to_string(),
            lock,
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

/// One caller's handle on an identity's lock.
///
/// Dropping it, on completion or when the `record` future is dropped, removes
/// the table entry once no other caller holds a handle.
struct KeyLease<'a> {
    guard: &'a AttendanceGuard,
    identity_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.guard.locks.lock();
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.identity_id);
        }
    }
}
