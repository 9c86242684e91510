//! HTTP segment upload.
//!
//! Posts the raw container bytes to the hub receiver with the manifest in
//! headers. Every call is bounded by the configured upload timeout; a
//! timeout or connection error surfaces as a retryable failure.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{SegmentManifest, UploadOutcome, UploadTransport};

pub struct HttpUploadTransport {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpUploadTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }
}

#[derive(serde::Deserialize)]
struct ReceiveResponse {
    status: String,
}

impl UploadTransport for HttpUploadTransport {
    fn upload(&self, manifest: &SegmentManifest, payload: &[u8]) -> Result<UploadOutcome> {
        let url = format!("{}/segments", self.base_url);
        let mut request = self
            .agent
            .post(&url)
            .set("content-type", "application/octet-stream")
            .set("x-camera-id", &manifest.camera_id)
            .set("x-start-ms", &manifest.start_ms.to_string())
            .set("x-frame-count", &manifest.frame_count.to_string())
            .set("x-checksum", &manifest.checksum);
        if let Some(end_ms) = manifest.end_ms {
            request = request.set("x-end-ms", &end_ms.to_string());
        }

        let response = request
            .send_bytes(payload)
            .map_err(|e| anyhow!("segment upload failed: {}", e))?;

        let body: ReceiveResponse = response
            .into_json()
            .map_err(|e| anyhow!("hub acknowledgement unreadable: {}", e))?;
        match body.status.as_str() {
            "accepted" => Ok(UploadOutcome::Accepted),
            "duplicate" => Ok(UploadOutcome::Duplicate),
            other => Err(anyhow!("hub acknowledgement unknown status '{}'", other)),
        }
    }
}
