//! Segment lifecycle state machine.
//!
//! One recorder per camera, driven only by that camera's capture loop, so
//! segment transitions are totally ordered without locks. Transitions are
//! keyed off frame timestamps, not wall clock, which keeps the machine
//! deterministic under test.
//!
//! States: Idle -> Open -> Closed -> PendingUpload (sync engine takes over
//! from there), with a Closed -> Open re-chain edge when the duration cap
//! fires while motion is still active, and Open -> Failed when the file
//! cannot be written or finalized.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::frame::{Frame, FrameRing};
use crate::segment::{segment_file_name, SegmentWriter};
use crate::storage::SegmentIndex;

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    /// A segment closes once this long passes without a motion frame.
    pub motion_timeout: Duration,
    /// Hard cap on one segment's duration; continuing motion chains a new
    /// segment immediately.
    pub max_segment_duration: Duration,
    /// Directory receiving per-camera segment subdirectories.
    pub storage_root: PathBuf,
}

struct OpenSegment {
    id: i64,
    writer: SegmentWriter,
    start_ms: u64,
    last_motion_ms: u64,
}

pub struct SegmentRecorder {
    camera_id: String,
    cfg: RecorderConfig,
    index: SegmentIndex,
    current: Option<OpenSegment>,
}

impl SegmentRecorder {
    pub fn new(camera_id: &str, cfg: RecorderConfig, index: SegmentIndex) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            cfg,
            index,
            current: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Drive the machine with one captured frame.
    ///
    /// `preroll` is the camera's ring buffer *before* this frame was pushed;
    /// it seeds a newly opened segment with pre-motion context.
    pub fn handle_frame(&mut self, frame: &Frame, motion: bool, preroll: &FrameRing) -> Result<()> {
        let ts = frame.timestamp_ms;

        if self.current.is_none() {
            if motion {
                self.open_segment(ts, ts, Some(preroll))?;
                self.append(frame)?;
            }
            return Ok(());
        }

        if motion {
            if let Some(open) = self.current.as_mut() {
                open.last_motion_ms = ts;
            }
        }

        let Some(open) = self.current.as_ref() else {
            return Ok(());
        };
        let timeout_ms = self.cfg.motion_timeout.as_millis() as u64;
        let cap_ms = self.cfg.max_segment_duration.as_millis() as u64;

        // Duration cap: close and, when motion carries over, chain a new
        // segment on the same camera without losing continuity.
        if ts.saturating_sub(open.start_ms) >= cap_ms {
            let carry_over = motion || ts.saturating_sub(open.last_motion_ms) < timeout_ms;
            self.close_current(ts)?;
            if carry_over {
                // Chained segments are not re-seeded; the ring's frames are
                // already in the previous file.
                self.open_segment(ts, ts, None)?;
                self.append(frame)?;
            }
            return Ok(());
        }

        // Motion timeout: no motion for the full window closes the segment.
        if ts.saturating_sub(open.last_motion_ms) >= timeout_ms {
            self.close_current(ts)?;
            return Ok(());
        }

        self.append(frame)
    }

    /// An accepted cross-camera trigger behaves exactly like locally
    /// detected motion: it opens a segment (with pre-roll) when idle and
    /// refreshes the motion window when one is already open.
    pub fn handle_trigger(&mut self, trigger_ms: u64, preroll: &FrameRing) -> Result<()> {
        match self.current.as_mut() {
            Some(open) => {
                open.last_motion_ms = open.last_motion_ms.max(trigger_ms);
                Ok(())
            }
            None => self.open_segment(trigger_ms, trigger_ms, Some(preroll)),
        }
    }

    /// Graceful drain: flush the open segment to Closed/PendingUpload
    /// before the owning loop exits. Never abandons a partial file.
    pub fn shutdown(&mut self, end_ms: u64) -> Result<()> {
        if self.current.is_some() {
            self.close_current(end_ms)?;
        }
        Ok(())
    }

    fn open_segment(
        &mut self,
        start_ms: u64,
        last_motion_ms: u64,
        preroll: Option<&FrameRing>,
    ) -> Result<()> {
        let dir = self.cfg.storage_root.join(&self.camera_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(segment_file_name(&self.camera_id, start_ms));
        let path_text = path.display().to_string();

        // Reserve the index row first: the one-open-per-camera invariant is
        // checked before any file exists.
        let id = self.index.open_segment(&self.camera_id, start_ms, &path_text)?;

        let writer = match SegmentWriter::create(&path, &self.camera_id, start_ms) {
            Ok(writer) => writer,
            Err(err) => {
                self.index.mark_failed(id, &format!("{}", err))?;
                return Err(err);
            }
        };

        let mut open = OpenSegment {
            id,
            writer,
            start_ms,
            last_motion_ms,
        };

        if let Some(ring) = preroll {
            for frame in ring.snapshot() {
                if let Err(err) = open.writer.append_frame(&frame) {
                    self.index.mark_failed(id, &format!("{}", err))?;
                    return Err(err);
                }
            }
        }

        log::info!(
            "camera {}: segment {} open at {} ({} pre-roll frames)",
            self.camera_id,
            id,
            start_ms,
            open.writer.frame_count()
        );
        self.current = Some(open);
        Ok(())
    }

    fn append(&mut self, frame: &Frame) -> Result<()> {
        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };
        if let Err(err) = open.writer.append_frame(frame) {
            // Disk trouble mid-segment: surface it, keep capturing. The
            // segment is terminal-failed and the machine returns to Idle.
            let id = open.id;
            self.current = None;
            self.index.mark_failed(id, &format!("{}", err))?;
            return Err(err);
        }
        Ok(())
    }

    fn close_current(&mut self, end_ms: u64) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        let id = open.id;
        match open.writer.finalize() {
            Ok(summary) => {
                self.index
                    .close_segment(id, end_ms, summary.frame_count, &summary.checksum)?;
                self.index.mark_pending_upload(id)?;
                log::info!(
                    "camera {}: segment {} closed at {} ({} frames, sha256 {})",
                    self.camera_id,
                    id,
                    end_ms,
                    summary.frame_count,
                    &summary.checksum[..12]
                );
                Ok(())
            }
            Err(err) => {
                // Corruption on close is terminal for this segment.
                self.index.mark_failed(id, &format!("{}", err))?;
                log::error!(
                    "camera {}: segment {} failed on close: {}",
                    self.camera_id,
                    id,
                    err
                );
                Ok(())
            }
        }
    }
}
