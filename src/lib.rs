//! watchpost - motion-triggered capture and remote processing
//!
//! This crate implements both halves of a small camera fleet pipeline:
//!
//! # Architecture
//!
//! On the edge device:
//!
//! 1. **Capture loops**: one thread per camera, sole owner of that camera's
//!    frame ring, motion state, and segment recorder.
//! 2. **Motion detection**: background-subtraction classifier on the active
//!    camera; a rising edge fans a trigger out to the other cameras.
//! 3. **Segment recording**: a per-camera state machine that opens, extends,
//!    chains, and closes bounded segment files seeded with pre-motion context.
//! 4. **Sync engine**: an independent scheduled task that uploads completed
//!    segments with bounded retries and cleans up old local files.
//!
//! On the hub:
//!
//! 5. **Processing queue**: uploads are durably queued before they are
//!    acknowledged; a single worker holds the one global processing slot.
//! 6. **Detection clustering**: raw inference output is folded into
//!    displayable events by temporal window and spatial overlap.
//!
//! # Module Structure
//!
//! - `frame`: frame type and the pre-motion ring buffer
//! - `ingest`: frame sources (synthetic `stub://` streams)
//! - `detect`: background-subtraction motion detector
//! - `segment`: segment container file format
//! - `recorder`: segment lifecycle state machine
//! - `capture`: per-camera loops and cross-camera trigger fan-out
//! - `storage`: durable segment index
//! - `sync` / `transport`: upload engine and transports
//! - `hub`: processing queue, worker, clustering, receiver

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod hub;
pub mod ingest;
pub mod recorder;
pub mod segment;
pub mod storage;
pub mod sync;
pub mod transport;

pub use capture::{spawn_camera_loop, CameraHandle, ControlMessage, TriggerBus};
pub use detect::{MotionDetector, MotionOutcome, MotionSettings};
pub use frame::{Frame, FrameRing};
pub use ingest::{open_source, FrameSource, SyntheticSource};
pub use recorder::{RecorderConfig, SegmentRecorder};
pub use segment::{SegmentFile, SegmentWriter};
pub use storage::{SegmentIndex, SegmentRecord};
pub use sync::{SyncEngine, SyncHandle};
pub use transport::{
    HttpUploadTransport, LoopbackTransport, SegmentManifest, UploadOutcome, UploadTransport,
};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// -------------------- Camera identity --------------------

/// A conforming camera id is a short local identifier, safe to embed in
/// file names and wire headers.
///
/// Allowed: "front_door", "lot-a-2", "cam03"
/// Disallowed: whitespace, slashes, punctuation outside [_-], leading '-'.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    // Compile once for hot paths.
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        CAMERA_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());

    if !re.is_match(camera_id) {
        return Err(anyhow!("camera id must match ^[a-z0-9][a-z0-9_-]{{0,63}}$"));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    /// Runs motion detection and originates cross-camera triggers.
    Active,
    /// Records only when triggered, locally or cross-camera.
    Passive,
}

/// Static per-camera capture parameters, built from configuration at
/// startup and owned by the capture loop for its lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: String,
    pub role: CameraRole,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frame source URL. `stub://` prefixes select the synthetic source.
    pub source: String,
}

// -------------------- Geometry --------------------

/// Axis-aligned pixel rectangle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    /// True when the rectangles share at least one pixel.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        BoundingBox {
            x,
            y,
            w: right - x,
            h: bottom - y,
        }
    }

    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }
}

// -------------------- Cross-camera triggers --------------------

/// In-process message fanned out to the other cameras' loops when the
/// active camera sees a motion rising edge.
#[derive(Clone, Debug)]
pub struct TriggerMessage {
    pub source_camera: String,
    pub timestamp_ms: u64,
    /// Wall-clock deadline. Receivers drop the trigger once this passes.
    pub deadline_ms: u64,
}

impl TriggerMessage {
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms > self.deadline_ms
    }
}

// -------------------- Segment & job states --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Closed,
    PendingUpload,
    Uploaded,
    Failed,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Open => "open",
            SegmentState::Closed => "closed",
            SegmentState::PendingUpload => "pending_upload",
            SegmentState::Uploaded => "uploaded",
            SegmentState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "open" => Ok(SegmentState::Open),
            "closed" => Ok(SegmentState::Closed),
            "pending_upload" => Ok(SegmentState::PendingUpload),
            "uploaded" => Ok(SegmentState::Uploaded),
            "failed" => Ok(SegmentState::Failed),
            other => Err(anyhow!("unknown segment state '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Done,
    Errored,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Done => "done",
            JobState::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "done" => Ok(JobState::Done),
            "errored" => Ok(JobState::Errored),
            other => Err(anyhow!("unknown job state '{}'", other)),
        }
    }
}

// -------------------- Detections --------------------

/// One raw detection from a single inference pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub region: BoundingBox,
    /// Timestamp of the sampled frame the detection came from.
    pub timestamp_ms: u64,
}

/// Raw detections clustered by temporal and spatial proximity into a
/// single displayable occurrence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub label: String,
    pub count: u32,
    pub first_ms: u64,
    pub last_ms: u64,
    pub peak_confidence: f32,
    pub region: BoundingBox,
}

// -------------------- Invariant violations --------------------

/// Programming-contract failure: the offending operation is rejected and
/// logged at highest severity rather than allowed to corrupt state.
#[derive(Clone, Debug)]
pub struct InvariantError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for InvariantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
impl std::error::Error for InvariantError {}

pub const INVARIANT_DUPLICATE_OPEN_SEGMENT: &str = "INVARIANT_DUPLICATE_OPEN_SEGMENT";
pub const INVARIANT_CONCURRENT_PROCESSING: &str = "INVARIANT_CONCURRENT_PROCESSING";
pub const INVARIANT_BAD_JOB_TRANSITION: &str = "INVARIANT_BAD_JOB_TRANSITION";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_id_allowlist_accepts_local_names() {
        assert!(validate_camera_id("front_door").is_ok());
        assert!(validate_camera_id("lot-a-2").is_ok());
        assert!(validate_camera_id("cam03").is_ok());
    }

    #[test]
    fn camera_id_allowlist_rejects_path_like_names() {
        assert!(validate_camera_id("").is_err());
        assert!(validate_camera_id("Front Door").is_err());
        assert!(validate_camera_id("../etc").is_err());
        assert!(validate_camera_id("-leading-dash").is_err());
        assert!(validate_camera_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn bounding_boxes_intersect_on_shared_pixels() {
        let a = BoundingBox { x: 0, y: 0, w: 10, h: 10 };
        let b = BoundingBox { x: 9, y: 9, w: 5, h: 5 };
        let c = BoundingBox { x: 10, y: 0, w: 5, h: 5 };
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c), "touching edges do not overlap");
    }

    #[test]
    fn bounding_box_union_covers_both() {
        let a = BoundingBox { x: 2, y: 3, w: 4, h: 4 };
        let b = BoundingBox { x: 10, y: 1, w: 2, h: 2 };
        let u = a.union(&b);
        assert_eq!(u, BoundingBox { x: 2, y: 1, w: 10, h: 6 });
    }

    #[test]
    fn trigger_staleness_is_a_deadline_comparison() {
        let trigger = TriggerMessage {
            source_camera: "front_door".to_string(),
            timestamp_ms: 1_000,
            deadline_ms: 3_000,
        };
        assert!(!trigger.is_stale(3_000));
        assert!(trigger.is_stale(3_001));
    }

    #[test]
    fn segment_state_round_trips_through_storage_text() {
        for state in [
            SegmentState::Open,
            SegmentState::Closed,
            SegmentState::PendingUpload,
            SegmentState::Uploaded,
            SegmentState::Failed,
        ] {
            assert_eq!(SegmentState::parse(state.as_str()).unwrap(), state);
        }
        assert!(SegmentState::parse("uploading").is_err());
    }
}
