use crate::schema::{DAY_FORMAT, SCHEMA, TIMESTAMP_FORMAT};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, AttendanceStore, DedupPolicy, EnrollmentStore,
    StoreError, StoredFace, ENCODED_LEN,
};
use rusqlite::{params, params_from_iter, ErrorCode, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Bound on every store round-trip unless configured otherwise.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Narrows the attendance queries; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub session_id: Option<String>,
    pub identity_id: Option<String>,
    /// Local calendar day of the record.
    pub day: Option<NaiveDate>,
    pub status: Option<AttendanceStatus>,
}

impl RecordFilter {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn day(day: NaiveDate) -> Self {
        Self {
            day: Some(day),
            ..Self::default()
        }
    }

    /// `WHERE` clause and its positional arguments.
    fn where_clause(&self) -> (String, Vec<String>) {
        let mut terms = Vec::new();
        let mut args = Vec::new();
        if let Some(session_id) = &self.session_id {
            args.push(session_id.clone());
            terms.push(format!("session_id = ?{}", args.len()));
        }
        if let Some(identity_id) = &self.identity_id {
            args.push(identity_id.clone());
            terms.push(format!("identity_id = ?{}", args.len()));
        }
        if let Some(day) = self.day {
            args.push(day.format(DAY_FORMAT).to_string());
            terms.push(format!("day = ?{}", args.len()));
        }
        if let Some(status) = self.status {
            args.push(status.as_str().to_string());
            terms.push(format!("status = ?{}", args.len()));
        }
        if terms.is_empty() {
            (String::new(), args)
        } else {
            (format!("WHERE {}", terms.join(" AND ")), args)
        }
    }
}

/// SQLite-backed enrollment and attendance store.
///
/// All statements run on the single background thread owned by
/// `tokio_rusqlite::Connection`, so each call is atomic with respect to the
/// others issued through this handle.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
    timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }

        let conn = tokio::time::timeout(timeout, tokio_rusqlite::Connection::open(&path))
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
            .map_err(map_err)?;

        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn, timeout).await
    }

    /// Private in-memory database, mostly for tests and dry runs.
    pub async fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(map_err)?;
        Self::init(conn, timeout).await
    }

    async fn init(conn: tokio_rusqlite::Connection, timeout: Duration) -> Result<Self, StoreError> {
        let store = Self { conn, timeout };
        store
            .call("init", move |c| {
                c.busy_timeout(timeout)?;
                c.execute_batch(SCHEMA)
            })
            .await?;
        Ok(store)
    }

    /// Run `f` on the connection thread, bounded by the store timeout.
    async fn call<F, R>(&self, op: &'static str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let fut = self
            .conn
            .call(move |c| f(c).map_err(tokio_rusqlite::Error::from));

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                let err = map_err(e);
                tracing::debug!(op, error = %err, "store operation failed");
                err
            }),
            Err(_) => {
                tracing::warn!(op, timeout = ?self.timeout, "store operation timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    /// Number of enrolled samples.
    pub async fn count_faces(&self) -> Result<usize, StoreError> {
        self.call("count_faces", |c| {
            c.query_row("SELECT COUNT(*) FROM enrolled_faces", [], |row| row.get::<_, i64>(0))
        })
        .await
        .map(|n| n as usize)
    }

    /// Every record written for a session, oldest first.
    pub async fn records_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.records(&RecordFilter::session(session_id)).await
    }

    /// Records matching `filter`, oldest first.
    pub async fn records(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let (clause, args) = filter.where_clause();
        self.call("records", move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT id, session_id, identity_id, recorded_at, status
                 FROM attendance
                 {clause}
                 ORDER BY recorded_at, rowid"
            ))?;
            let rows = stmt.query_map(params_from_iter(args), parse_record_row)?;
            rows.collect()
        })
        .await
    }

    /// Count of records per status for a session.
    pub async fn session_summary(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<String, usize>, StoreError> {
        self.summary(&RecordFilter::session(session_id)).await
    }

    /// Distinct identities per status among the records matching `filter`.
    ///
    /// A day filter alone gives the daily summary across every session.
    pub async fn summary(&self, filter: &RecordFilter) -> Result<BTreeMap<String, usize>, StoreError> {
        let (clause, args) = filter.where_clause();
        self.call("summary", move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT status, COUNT(DISTINCT identity_id)
                 FROM attendance
                 {clause}
                 GROUP BY status"
            ))?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl EnrollmentStore for SqliteStore {
    async fn list_all(&self) -> Result<Vec<StoredFace>, StoreError> {
        self.call("list_all", |c| {
            let mut stmt = c.prepare(
                "SELECT id, identity_id, source_image_reference, vector
                 FROM enrolled_faces
                 ORDER BY rowid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredFace {
                    id: row.get(0)?,
                    identity_id: row.get(1)?,
                    source_image_reference: row.get(2)?,
                    vector_bytes: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn insert(
        &self,
        identity_id: &str,
        source_image_reference: &str,
        vector_bytes: &[u8],
    ) -> Result<String, StoreError> {
        if vector_bytes.len() != ENCODED_LEN {
            return Err(StoreError::InvalidVector {
                expected: ENCODED_LEN,
                actual: vector_bytes.len(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string();
        let row = (
            id.clone(),
            identity_id.to_string(),
            source_image_reference.to_string(),
            vector_bytes.to_vec(),
        );

        self.call("insert_face", move |c| {
            c.execute(
                "INSERT INTO enrolled_faces (id, identity_id, source_image_reference, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.0, row.1, row.2, row.3, created_at],
            )
        })
        .await?;

        Ok(id)
    }

    async fn delete_identity(&self, identity_id: &str) -> Result<usize, StoreError> {
        let identity_id = identity_id.to_string();
        self.call("delete_identity", move |c| {
            c.execute(
                "DELETE FROM enrolled_faces WHERE identity_id = ?1",
                params![identity_id],
            )
        })
        .await
    }
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn exists(
        &self,
        session_id: &str,
        identity_id: &str,
        policy: DedupPolicy,
        as_of: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        let identity_id = identity_id.to_string();
        let day = as_of.format(DAY_FORMAT).to_string();

        self.call("attendance_exists", move |c| match policy {
            DedupPolicy::Session => c.query_row(
                "SELECT EXISTS(SELECT 1 FROM attendance WHERE session_id = ?1 AND identity_id = ?2)",
                params![session_id, identity_id],
                |row| row.get(0),
            ),
            DedupPolicy::Day => c.query_row(
                "SELECT EXISTS(SELECT 1 FROM attendance WHERE identity_id = ?1 AND day = ?2)",
                params![identity_id, day],
                |row| row.get(0),
            ),
        })
        .await
    }

    async fn insert_record(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let record = record.clone();
        let changed = self
            .call("insert_record", move |c| {
                c.execute(
                    "INSERT OR IGNORE INTO attendance (id, session_id, identity_id, recorded_at, day, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.id,
                        record.session_id,
                        record.identity_id,
                        record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                        record.timestamp.format(DAY_FORMAT).to_string(),
                        record.status.as_str(),
                    ],
                )
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::Duplicate);
        }
        Ok(())
    }

    async fn bulk_insert_absent(
        &self,
        session_id: &str,
        roster: &[String],
        at: NaiveDateTime,
    ) -> Result<usize, StoreError> {
        let session_id = session_id.to_string();
        let roster = roster.to_vec();
        let recorded_at = at.format(TIMESTAMP_FORMAT).to_string();
        let day = at.format(DAY_FORMAT).to_string();

        self.call("bulk_insert_absent", move |c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut inserted = 0usize;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO attendance (id, session_id, identity_id, recorded_at, day, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for identity_id in &roster {
                    inserted += stmt.execute(params![
                        uuid::Uuid::new_v4().to_string(),
                        session_id,
                        identity_id,
                        recorded_at,
                        day,
                        AttendanceStatus::Absent.as_str(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let recorded_at: String = row.get(3)?;
    let timestamp = NaiveDateTime::parse_from_str(&recorded_at, TIMESTAMP_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status: String = row.get(4)?;
    let status = status.parse::<AttendanceStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;

    Ok(AttendanceRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        identity_id: row.get(2)?,
        timestamp,
        status,
    })
}

fn map_err(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::ConnectionClosed => {
            StoreError::Unavailable("database connection closed".into())
        }
        tokio_rusqlite::Error::Rusqlite(e) => map_sqlite_err(e),
        other => StoreError::Backend(other.to_string()),
    }
}

fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
            ) =>
        {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}
