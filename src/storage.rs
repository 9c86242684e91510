//! Durable segment index.
//!
//! Every segment's lifecycle state lives in one SQLite table shared by the
//! capture loops (which drive transitions for their own camera only) and
//! the sync engine (which drives upload states). Each thread opens its own
//! connection; WAL keeps the writers from blocking each other.
//!
//! The "at most one open segment per camera" invariant is enforced by a
//! partial unique index, so a duplicate open is rejected by the database
//! itself no matter which code path attempts it.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OpenFlags};

use crate::{InvariantError, SegmentState, INVARIANT_DUPLICATE_OPEN_SEGMENT};

/// One row of the segment index.
#[derive(Clone, Debug)]
pub struct SegmentRecord {
    pub id: i64,
    pub camera_id: String,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub path: String,
    pub state: SegmentState,
    pub frame_count: u32,
    pub checksum: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_ms: u64,
    pub uploaded_ms: Option<u64>,
    pub local_file_deleted: bool,
}

pub struct SegmentIndex {
    conn: Connection,
}

impl SegmentIndex {
    /// Open (and create) the index. `file:` URIs are honored so tests can
    /// share an in-memory database across connections.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(db_path)?
        };
        let mut index = Self { conn };
        index.ensure_schema()?;
        Ok(index)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS segments (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              start_ms INTEGER NOT NULL,
              end_ms INTEGER,
              path TEXT NOT NULL,
              state TEXT NOT NULL,
              frame_count INTEGER NOT NULL DEFAULT 0,
              checksum TEXT,
              attempts INTEGER NOT NULL DEFAULT 0,
              last_error TEXT,
              next_attempt_ms INTEGER NOT NULL DEFAULT 0,
              uploaded_ms INTEGER,
              local_file_deleted INTEGER NOT NULL DEFAULT 0,
              UNIQUE(camera_id, start_ms)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_segments_one_open
              ON segments(camera_id) WHERE state = 'open';
            CREATE INDEX IF NOT EXISTS idx_segments_state ON segments(state);
            "#,
        )?;
        Ok(())
    }

    /// Record a newly opened segment. Violating the one-open-per-camera
    /// index is a contract failure, not an I/O error.
    pub fn open_segment(&mut self, camera_id: &str, start_ms: u64, path: &str) -> Result<i64> {
        let result = self.conn.execute(
            "INSERT INTO segments(camera_id, start_ms, path, state) VALUES (?1, ?2, ?3, ?4)",
            params![camera_id, start_ms as i64, path, SegmentState::Open.as_str()],
        );
        match result {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(err) if is_constraint_violation(&err) => Err(InvariantError {
                code: INVARIANT_DUPLICATE_OPEN_SEGMENT,
                message: format!("camera {} already has an open segment", camera_id),
            }
            .into()),
            Err(err) => Err(err.into()),
        }
    }

    /// `Open -> Closed` with the final frame count and payload digest.
    pub fn close_segment(
        &mut self,
        id: i64,
        end_ms: u64,
        frame_count: u32,
        checksum: &str,
    ) -> Result<()> {
        self.expect_transition(
            id,
            "UPDATE segments SET state = 'closed', end_ms = ?2, frame_count = ?3, checksum = ?4
             WHERE id = ?1 AND state = 'open'",
            params![id, end_ms as i64, frame_count, checksum],
            "close",
        )
    }

    /// `Closed -> PendingUpload` once the file handle is flushed.
    pub fn mark_pending_upload(&mut self, id: i64) -> Result<()> {
        self.expect_transition(
            id,
            "UPDATE segments SET state = 'pending_upload' WHERE id = ?1 AND state = 'closed'",
            params![id],
            "mark pending_upload",
        )
    }

    /// Terminal failure: corrupt file, missing file, or exhausted retries.
    /// The row stays queryable for operators.
    pub fn mark_failed(&mut self, id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE segments SET state = 'failed', last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    pub fn mark_uploaded(&mut self, id: i64, uploaded_ms: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE segments SET state = 'uploaded', uploaded_ms = ?2, last_error = NULL
             WHERE id = ?1",
            params![id, uploaded_ms as i64],
        )?;
        Ok(())
    }

    /// Record a failed upload attempt and when to try again. When `park`
    /// is set the segment moves to `failed` (retry budget exhausted); it
    /// remains eligible for later passes once its backoff expires.
    pub fn record_attempt(
        &mut self,
        id: i64,
        attempts: u32,
        error: &str,
        next_attempt_ms: u64,
        park: bool,
    ) -> Result<()> {
        let state = if park {
            SegmentState::Failed.as_str()
        } else {
            SegmentState::PendingUpload.as_str()
        };
        self.conn.execute(
            "UPDATE segments
             SET attempts = ?2, last_error = ?3, next_attempt_ms = ?4, state = ?5
             WHERE id = ?1",
            params![id, attempts, error, next_attempt_ms as i64, state],
        )?;
        Ok(())
    }

    /// Segments due for upload: pending, plus parked failures whose
    /// backoff has expired (they are retried on later scheduled passes).
    pub fn list_due_uploads(&self, now_ms: u64) -> Result<Vec<SegmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, camera_id, start_ms, end_ms, path, state, frame_count, checksum,
                    attempts, last_error, next_attempt_ms, uploaded_ms, local_file_deleted
             FROM segments
             WHERE state IN ('pending_upload', 'failed')
               AND local_file_deleted = 0
               AND next_attempt_ms <= ?1
             ORDER BY start_ms ASC",
        )?;
        let rows = stmt.query_map(params![now_ms as i64], row_to_record)?;
        collect_records(rows)
    }

    /// Uploaded segments whose local file is past retention and still on
    /// disk. Returns (id, path) pairs for deletion.
    pub fn list_cleanup_candidates(&self, cutoff_ms: u64) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path FROM segments
             WHERE state = 'uploaded' AND local_file_deleted = 0 AND uploaded_ms < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff_ms as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_local_deleted(&mut self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE segments SET local_file_deleted = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<SegmentRecord> {
        let mut stmt = self.conn.prepare(
            "SELECT id, camera_id, start_ms, end_ms, path, state, frame_count, checksum,
                    attempts, last_error, next_attempt_ms, uploaded_ms, local_file_deleted
             FROM segments WHERE id = ?1",
        )?;
        let record = stmt.query_row(params![id], row_to_record)?;
        Ok(record)
    }

    /// All segments, newest first, for the operator tool.
    pub fn list_all(&self, limit: usize) -> Result<Vec<SegmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, camera_id, start_ms, end_ms, path, state, frame_count, checksum,
                    attempts, last_error, next_attempt_ms, uploaded_ms, local_file_deleted
             FROM segments ORDER BY start_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        collect_records(rows)
    }

    /// Open-segment count for one camera. Exists for invariant checks.
    pub fn open_count(&self, camera_id: &str) -> Result<u32> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM segments WHERE camera_id = ?1 AND state = 'open'",
            params![camera_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn expect_transition(
        &mut self,
        id: i64,
        sql: &str,
        values: &[&dyn rusqlite::ToSql],
        what: &str,
    ) -> Result<()> {
        let updated = self.conn.execute(sql, values)?;
        if updated != 1 {
            return Err(anyhow!(
                "segment {}: cannot {} (row missing or wrong state)",
                id,
                what
            ));
        }
        Ok(())
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation)
    )
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SegmentRecord> {
    let state_text: String = row.get(5)?;
    let state = SegmentState::parse(&state_text).unwrap_or(SegmentState::Failed);
    Ok(SegmentRecord {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        start_ms: row.get::<_, i64>(2)? as u64,
        end_ms: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        path: row.get(4)?,
        state,
        frame_count: row.get(6)?,
        checksum: row.get(7)?,
        attempts: row.get(8)?,
        last_error: row.get(9)?,
        next_attempt_ms: row.get::<_, i64>(10)? as u64,
        uploaded_ms: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        local_file_deleted: row.get::<_, i64>(12)? != 0,
    })
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<SegmentRecord>>,
) -> Result<Vec<SegmentRecord>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
