//! Segment upload transports.
//!
//! The sync engine pushes completed segments through an `UploadTransport`.
//! The transfer is idempotent keyed by (camera id, start timestamp): a
//! duplicate upload of an already-received segment is a no-op
//! acknowledgement, never an error, so retries after ambiguous failures
//! are always safe.

mod http;
mod loopback;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use http::HttpUploadTransport;
pub use loopback::LoopbackTransport;

/// Metadata accompanying a segment payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub camera_id: String,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub frame_count: u32,
    /// Hex SHA-256 of the frame payloads, as written in the container
    /// footer. The receiver re-verifies it before queueing.
    pub checksum: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Newly received and durably queued.
    Accepted,
    /// Already received earlier; acknowledged without re-queueing.
    Duplicate,
}

pub trait UploadTransport {
    /// Transfer one segment. An `Err` is retryable; the engine backs off
    /// and tries again on a later pass.
    fn upload(&self, manifest: &SegmentManifest, payload: &[u8]) -> Result<UploadOutcome>;
}
