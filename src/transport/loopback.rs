//! In-process transport feeding a hub queue directly.
//!
//! Used by the demo binary and by tests that exercise the full
//! edge-to-hub path without a network in the middle.

use anyhow::Result;
use std::sync::{Arc, Mutex};

use crate::hub::queue::{ProcessingQueue, ReceiveOutcome};

use super::{SegmentManifest, UploadOutcome, UploadTransport};

pub struct LoopbackTransport {
    queue: Arc<Mutex<ProcessingQueue>>,
}

impl LoopbackTransport {
    pub fn new(queue: Arc<Mutex<ProcessingQueue>>) -> Self {
        Self { queue }
    }
}

impl UploadTransport for LoopbackTransport {
    fn upload(&self, manifest: &SegmentManifest, payload: &[u8]) -> Result<UploadOutcome> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow::anyhow!("processing queue lock poisoned"))?;
        match queue.receive(manifest, payload)? {
            ReceiveOutcome::Queued(_) => Ok(UploadOutcome::Accepted),
            ReceiveOutcome::Duplicate => Ok(UploadOutcome::Duplicate),
        }
    }
}
