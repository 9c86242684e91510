//! Frame sources.
//!
//! A capture loop pulls frames from exactly one source. The only built-in
//! source is the synthetic `stub://` generator used by tests, the demo, and
//! bench deployments without camera hardware; real camera ingest (RTSP,
//! V4L2) lives behind the same trait in deployment-specific builds.
//!
//! Sources are responsible for producing frames at the configured
//! dimensions and stamping capture timestamps. They must not block longer
//! than roughly one frame interval; a failed acquisition is returned as an
//! error and skipped by the loop, never allowed to kill it.

mod synthetic;

use anyhow::{bail, Result};

use crate::frame::Frame;
use crate::CameraSpec;

pub use synthetic::SyntheticSource;

pub trait FrameSource {
    /// Acquire the next frame. Errors are transient: the caller logs and
    /// skips, the source is expected to recover on a later call.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Human-readable description for startup logs.
    fn describe(&self) -> String;
}

/// Build the frame source a camera spec asks for.
pub fn open_source(spec: &CameraSpec) -> Result<Box<dyn FrameSource + Send>> {
    if spec.source.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(spec)?));
    }
    bail!(
        "unsupported frame source '{}' (only stub:// sources are built in)",
        spec.source
    )
}
