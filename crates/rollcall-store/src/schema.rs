//! Table definitions, applied on every open.

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS enrolled_faces (
    id                     TEXT PRIMARY KEY,
    identity_id            TEXT NOT NULL,
    source_image_reference TEXT NOT NULL,
    vector                 BLOB NOT NULL,
    created_at             TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_enrolled_faces_identity
    ON enrolled_faces (identity_id);

CREATE TABLE IF NOT EXISTS attendance (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    identity_id TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    day         TEXT NOT NULL,
    status      TEXT NOT NULL,
    UNIQUE (session_id, identity_id)
);

CREATE INDEX IF NOT EXISTS idx_attendance_identity_day
    ON attendance (identity_id, day);
";

/// Wall-clock timestamp format stored in `recorded_at` / `created_at`.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Calendar day format stored in `attendance.day`.
pub(crate) const DAY_FORMAT: &str = "%Y-%m-%d";
