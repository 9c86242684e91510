//! Durable processing queue.
//!
//! Uploads become `pending` jobs the moment they are received: the payload
//! is spooled to disk and the job row committed *before* the caller gets
//! its acknowledgement, so an acked segment can never be lost to a crash.
//! Receipt is idempotent on (camera id, start timestamp); re-receiving a
//! known segment is a no-op duplicate acknowledgement.
//!
//! Processing runs through one global slot. The queue is shared behind a
//! single mutex, so `claim` performs its "is anything processing?" check
//! and the `pending -> processing` write as one indivisible operation;
//! two entry points can never both observe an idle slot and both start.
//! A `processing` row observed where the slot should be free is reported
//! as an invariant violation and the claim is rejected rather than
//! allowed to corrupt state.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::segment::{segment_file_name, SegmentFile};
use crate::transport::SegmentManifest;
use crate::{
    now_ms, DetectionEvent, InvariantError, JobState, INVARIANT_BAD_JOB_TRANSITION,
    INVARIANT_CONCURRENT_PROCESSING,
};

#[derive(Clone, Debug)]
pub enum ReceiveOutcome {
    /// Durably queued; the id of the new job.
    Queued(i64),
    /// Already received earlier.
    Duplicate,
}

/// A job handed to the worker while it holds the processing slot.
#[derive(Clone, Debug)]
pub struct ClaimedJob {
    pub id: i64,
    pub camera_id: String,
    pub start_ms: u64,
    pub spool_path: PathBuf,
}

/// One row of the jobs table, for operator views.
#[derive(Clone, Debug, serde::Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub camera_id: String,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub state: String,
    pub received_ms: u64,
    pub finished_ms: Option<u64>,
    pub detection_count: u32,
    pub last_error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SweepStats {
    pub jobs_removed: usize,
    pub events_removed: usize,
}

pub struct ProcessingQueue {
    conn: Connection,
    spool_root: PathBuf,
}

impl ProcessingQueue {
    pub fn open(db_path: &str, spool_root: &Path) -> Result<Self> {
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
        std::fs::create_dir_all(spool_root)?;
        let mut queue = Self {
            conn,
            spool_root: spool_root.to_path_buf(),
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              start_ms INTEGER NOT NULL,
              end_ms INTEGER,
              frame_count INTEGER NOT NULL DEFAULT 0,
              checksum TEXT NOT NULL,
              spool_path TEXT NOT NULL,
              state TEXT NOT NULL,
              received_ms INTEGER NOT NULL,
              started_ms INTEGER,
              finished_ms INTEGER,
              detection_count INTEGER NOT NULL DEFAULT 0,
              last_error TEXT,
              UNIQUE(camera_id, start_ms)
            );

            CREATE TABLE IF NOT EXISTS detection_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job_id INTEGER NOT NULL,
              camera_id TEXT NOT NULL,
              label TEXT NOT NULL,
              count INTEGER NOT NULL,
              first_ms INTEGER NOT NULL,
              last_ms INTEGER NOT NULL,
              peak_confidence REAL NOT NULL,
              x INTEGER NOT NULL,
              y INTEGER NOT NULL,
              w INTEGER NOT NULL,
              h INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_events_job ON detection_events(job_id);
            "#,
        )?;
        Ok(())
    }

    /// Receive one uploaded segment.
    ///
    /// Verifies the payload against its manifest, spools it, and commits
    /// the `pending` job. Only after the commit does the caller get its
    /// success acknowledgement. Duplicate (camera, start) pairs are
    /// acknowledged without re-queueing.
    pub fn receive(&mut self, manifest: &SegmentManifest, payload: &[u8]) -> Result<ReceiveOutcome> {
        crate::validate_camera_id(&manifest.camera_id)?;

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM jobs WHERE camera_id = ?1 AND start_ms = ?2",
                params![manifest.camera_id, manifest.start_ms as i64],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            log::debug!(
                "duplicate upload for {}/{} acknowledged",
                manifest.camera_id,
                manifest.start_ms
            );
            return Ok(ReceiveOutcome::Duplicate);
        }

        // The container carries its own digest; a corrupt transfer is
        // rejected here so the edge retries rather than queueing garbage.
        let decoded = SegmentFile::decode(payload)
            .map_err(|e| anyhow!("rejected upload: {}", e))?;
        if decoded.checksum != manifest.checksum {
            return Err(anyhow!(
                "rejected upload: manifest checksum {} does not match payload {}",
                manifest.checksum,
                decoded.checksum
            ));
        }
        if decoded.camera_id != manifest.camera_id {
            return Err(anyhow!(
                "rejected upload: manifest camera {} does not match payload {}",
                manifest.camera_id,
                decoded.camera_id
            ));
        }

        let camera_dir = self.spool_root.join(&manifest.camera_id);
        std::fs::create_dir_all(&camera_dir)?;
        let spool_path = camera_dir.join(segment_file_name(&manifest.camera_id, manifest.start_ms));
        std::fs::write(&spool_path, payload)?;

        let inserted = self.conn.execute(
            "INSERT INTO jobs(camera_id, start_ms, end_ms, frame_count, checksum, spool_path,
                              state, received_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                manifest.camera_id,
                manifest.start_ms as i64,
                manifest.end_ms.map(|v| v as i64),
                manifest.frame_count,
                manifest.checksum,
                spool_path.display().to_string(),
                JobState::Pending.as_str(),
                now_ms() as i64,
            ],
        );
        match inserted {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                log::info!(
                    "queued job {} for {}/{} ({} frames)",
                    id,
                    manifest.camera_id,
                    manifest.start_ms,
                    manifest.frame_count
                );
                Ok(ReceiveOutcome::Queued(id))
            }
            Err(err) if is_constraint_violation(&err) => Ok(ReceiveOutcome::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    /// Claim the next pending job, taking the single processing slot.
    ///
    /// The caller holds this queue behind a mutex, so the busy check and
    /// the state write below are one indivisible operation.
    pub fn claim(&mut self) -> Result<Option<ClaimedJob>> {
        let processing: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = 'processing'",
            [],
            |row| row.get(0),
        )?;
        if processing > 0 {
            // Normal when the worker is mid-job and a second entry point
            // polls; more than one row would be a broken invariant.
            if processing > 1 {
                let violation = InvariantError {
                    code: INVARIANT_CONCURRENT_PROCESSING,
                    message: format!("{} jobs in processing state", processing),
                };
                log::error!("{}", violation);
                return Err(violation.into());
            }
            return Ok(None);
        }

        let next: Option<(i64, String, i64, String)> = self
            .conn
            .query_row(
                "SELECT id, camera_id, start_ms, spool_path FROM jobs
                 WHERE state = 'pending' ORDER BY received_ms ASC, id ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((id, camera_id, start_ms, spool_path)) = next else {
            return Ok(None);
        };

        let updated = self.conn.execute(
            "UPDATE jobs SET state = 'processing', started_ms = ?2
             WHERE id = ?1 AND state = 'pending'",
            params![id, now_ms() as i64],
        )?;
        if updated != 1 {
            let violation = InvariantError {
                code: INVARIANT_CONCURRENT_PROCESSING,
                message: format!("job {} changed state during claim", id),
            };
            log::error!("{}", violation);
            return Err(violation.into());
        }

        Ok(Some(ClaimedJob {
            id,
            camera_id,
            start_ms: start_ms as u64,
            spool_path: PathBuf::from(spool_path),
        }))
    }

    /// `Processing -> Done` with the clustered results.
    pub fn complete(&mut self, job_id: i64, events: &[DetectionEvent]) -> Result<()> {
        self.expect_processing(job_id, "complete")?;
        let tx = self.conn.transaction()?;
        let camera_id: String = tx.query_row(
            "SELECT camera_id FROM jobs WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        for event in events {
            tx.execute(
                "INSERT INTO detection_events(job_id, camera_id, label, count, first_ms, last_ms,
                                              peak_confidence, x, y, w, h)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job_id,
                    camera_id,
                    event.label,
                    event.count,
                    event.first_ms as i64,
                    event.last_ms as i64,
                    event.peak_confidence as f64,
                    event.region.x,
                    event.region.y,
                    event.region.w,
                    event.region.h,
                ],
            )?;
        }
        tx.execute(
            "UPDATE jobs SET state = 'done', finished_ms = ?2, detection_count = ?3
             WHERE id = ?1",
            params![job_id, now_ms() as i64, events.len() as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// `Processing -> Errored`. Errored jobs are surfaced, never
    /// automatically retried.
    pub fn fail(&mut self, job_id: i64, error: &str) -> Result<()> {
        self.expect_processing(job_id, "fail")?;
        self.conn.execute(
            "UPDATE jobs SET state = 'errored', finished_ms = ?2, last_error = ?3
             WHERE id = ?1",
            params![job_id, now_ms() as i64, error],
        )?;
        Ok(())
    }

    fn expect_processing(&self, job_id: i64, what: &str) -> Result<()> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        match state.as_deref() {
            Some("processing") => Ok(()),
            Some(other) => {
                let violation = InvariantError {
                    code: INVARIANT_BAD_JOB_TRANSITION,
                    message: format!("cannot {} job {} in state {}", what, job_id, other),
                };
                log::error!("{}", violation);
                Err(violation.into())
            }
            None => Err(anyhow!("job {} not found", job_id)),
        }
    }

    pub fn count_in_state(&self, state: JobState) -> Result<u32> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Newest jobs first, for the receiver's operator view.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, camera_id, start_ms, end_ms, state, received_ms, finished_ms,
                    detection_count, last_error
             FROM jobs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(JobRecord {
                id: row.get(0)?,
                camera_id: row.get(1)?,
                start_ms: row.get::<_, i64>(2)? as u64,
                end_ms: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                state: row.get(4)?,
                received_ms: row.get::<_, i64>(5)? as u64,
                finished_ms: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                detection_count: row.get(7)?,
                last_error: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_events(&self, limit: usize) -> Result<Vec<(i64, String, DetectionEvent)>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, camera_id, label, count, first_ms, last_ms, peak_confidence,
                    x, y, w, h
             FROM detection_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                DetectionEvent {
                    label: row.get(2)?,
                    count: row.get(3)?,
                    first_ms: row.get::<_, i64>(4)? as u64,
                    last_ms: row.get::<_, i64>(5)? as u64,
                    peak_confidence: row.get::<_, f64>(6)? as f32,
                    region: crate::BoundingBox {
                        x: row.get(7)?,
                        y: row.get(8)?,
                        w: row.get(9)?,
                        h: row.get(10)?,
                    },
                },
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete finished jobs (and their events and spooled files) past
    /// retention: `detection_retention` when the job produced detections,
    /// `no_detection_retention` when it produced none.
    pub fn retention_sweep(
        &mut self,
        now_ms: u64,
        detection_retention_ms: u64,
        no_detection_retention_ms: u64,
    ) -> Result<SweepStats> {
        let with_cutoff = now_ms.saturating_sub(detection_retention_ms) as i64;
        let without_cutoff = now_ms.saturating_sub(no_detection_retention_ms) as i64;

        let expired: Vec<(i64, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, spool_path FROM jobs
                 WHERE state IN ('done', 'errored')
                   AND finished_ms IS NOT NULL
                   AND ((detection_count > 0 AND finished_ms <= ?1)
                        OR (detection_count = 0 AND finished_ms <= ?2))",
            )?;
            let rows = stmt.query_map(params![with_cutoff, without_cutoff], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut stats = SweepStats::default();
        for (job_id, spool_path) in expired {
            let tx = self.conn.transaction()?;
            stats.events_removed += tx.execute(
                "DELETE FROM detection_events WHERE job_id = ?1",
                params![job_id],
            )?;
            stats.jobs_removed += tx.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
            tx.commit()?;
            if let Err(err) = std::fs::remove_file(&spool_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("retention sweep: removing {} failed: {}", spool_path, err);
                }
            }
        }
        if stats.jobs_removed > 0 {
            log::info!(
                "retention sweep removed {} jobs and {} events",
                stats.jobs_removed,
                stats.events_removed
            );
        }
        Ok(stats)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation)
    )
}
