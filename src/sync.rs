//! Sync engine: uploads completed segments to the hub.
//!
//! Runs on its own thread in a fixed-interval loop, fully decoupled from
//! the capture loops. Each pass scans the segment index for due uploads,
//! pushes each through the transport under the configured timeout, and
//! schedules retries with bounded exponential backoff. Uploads are
//! idempotent at the receiver, so a retry after an ambiguous failure can
//! never duplicate work.
//!
//! Retry policy: attempts back off as `base * 2^(attempts-1)` capped at
//! `backoff_cap`, with up to 25% added jitter to keep a fleet of devices
//! from thundering in lockstep. Once `max_attempts` is exhausted the
//! segment is parked in `failed` but remains eligible on later scheduled
//! passes; it stays visible to operators either way.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::storage::{SegmentIndex, SegmentRecord};
use crate::transport::{SegmentManifest, UploadTransport};
use crate::now_ms;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub local_retention: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl SyncConfig {
    pub fn new(interval: Duration, max_attempts: u32, local_retention: Duration) -> Self {
        Self {
            interval,
            max_attempts,
            local_retention,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Per-pass counters, logged after every pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub scanned: usize,
    pub uploaded: usize,
    pub duplicates: usize,
    pub failures: usize,
    pub cleaned: usize,
}

pub struct SyncEngine {
    cfg: SyncConfig,
    index: SegmentIndex,
    transport: Box<dyn UploadTransport + Send>,
}

impl SyncEngine {
    pub fn new(
        cfg: SyncConfig,
        index: SegmentIndex,
        transport: Box<dyn UploadTransport + Send>,
    ) -> Self {
        Self {
            cfg,
            index,
            transport,
        }
    }

    /// Run passes on the configured interval until stopped.
    pub fn spawn(self) -> SyncHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("sync-engine".to_string())
            .spawn(move || {
                let mut engine = self;
                loop {
                    match engine.run_pass() {
                        Ok(stats) => {
                            if stats.scanned > 0 || stats.cleaned > 0 {
                                log::info!(
                                    "sync pass: {} scanned, {} uploaded, {} duplicate, {} failed, {} cleaned",
                                    stats.scanned,
                                    stats.uploaded,
                                    stats.duplicates,
                                    stats.failures,
                                    stats.cleaned
                                );
                            }
                        }
                        Err(err) => log::error!("sync pass failed: {}", err),
                    }
                    // Sleep in slices so shutdown is prompt.
                    let mut remaining = engine.cfg.interval;
                    while !remaining.is_zero() {
                        if shutdown_thread.load(Ordering::SeqCst) {
                            return;
                        }
                        let slice = remaining.min(Duration::from_millis(200));
                        std::thread::sleep(slice);
                        remaining = remaining.saturating_sub(slice);
                    }
                }
            })
            .expect("spawn sync thread");
        SyncHandle {
            shutdown,
            join: Some(join),
        }
    }

    /// One full scan-upload-cleanup pass. Public so tests and the demo can
    /// drive it directly.
    pub fn run_pass(&mut self) -> Result<PassStats> {
        let now = now_ms();
        let mut stats = PassStats::default();

        let due = self.index.list_due_uploads(now)?;
        stats.scanned = due.len();

        // Guards against uploading the same file twice within a pass, even
        // if the index hands back an aliased row.
        let mut in_flight: HashSet<i64> = HashSet::new();

        for segment in due {
            if !in_flight.insert(segment.id) {
                continue;
            }
            if !std::path::Path::new(&segment.path).exists() {
                // Permanent: nothing left to retry against. The row stays
                // visible but leaves the upload scan.
                log::error!("segment {} file missing: {}", segment.id, segment.path);
                self.index
                    .mark_failed(segment.id, "segment file missing from disk")?;
                self.index.mark_local_deleted(segment.id)?;
                stats.failures += 1;
                continue;
            }
            match self.upload_one(&segment) {
                Ok(crate::transport::UploadOutcome::Accepted) => {
                    self.index.mark_uploaded(segment.id, now_ms())?;
                    stats.uploaded += 1;
                }
                Ok(crate::transport::UploadOutcome::Duplicate) => {
                    // Receiver already has it; a duplicate ack completes the
                    // segment the same way a fresh accept does.
                    self.index.mark_uploaded(segment.id, now_ms())?;
                    stats.duplicates += 1;
                }
                Err(err) => {
                    stats.failures += 1;
                    self.note_failure(&segment, &err)?;
                }
            }
        }

        stats.cleaned = self.cleanup(now)?;
        Ok(stats)
    }

    fn upload_one(&mut self, segment: &SegmentRecord) -> Result<crate::transport::UploadOutcome> {
        let payload = std::fs::read(&segment.path)
            .map_err(|e| anyhow!("failed to read segment {}: {}", segment.path, e))?;

        let manifest = SegmentManifest {
            camera_id: segment.camera_id.clone(),
            start_ms: segment.start_ms,
            end_ms: segment.end_ms,
            frame_count: segment.frame_count,
            checksum: segment.checksum.clone().unwrap_or_default(),
        };
        self.transport.upload(&manifest, &payload)
    }

    fn note_failure(&mut self, segment: &SegmentRecord, err: &anyhow::Error) -> Result<()> {
        let attempts = segment.attempts + 1;
        let park = attempts >= self.cfg.max_attempts;
        let delay = self.backoff_delay(attempts);
        let next_attempt_ms = now_ms() + delay.as_millis() as u64;
        log::warn!(
            "segment {} upload attempt {} failed ({}); next attempt in {:?}{}",
            segment.id,
            attempts,
            err,
            delay,
            if park { " [parked]" } else { "" }
        );
        self.index
            .record_attempt(segment.id, attempts, &format!("{}", err), next_attempt_ms, park)
    }

    /// Bounded exponential backoff with jitter.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let base_ms = self.cfg.backoff_base.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cfg.backoff_cap.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=delay_ms / 4 + 1);
        Duration::from_millis(delay_ms + jitter)
    }

    /// Delete local files of uploaded segments past retention. Rows are
    /// kept so operators can still see upload history.
    fn cleanup(&mut self, now: u64) -> Result<usize> {
        let retention_ms = self.cfg.local_retention.as_millis() as u64;
        let cutoff = now.saturating_sub(retention_ms);
        let mut cleaned = 0;
        for (id, path) in self.index.list_cleanup_candidates(cutoff)? {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    self.index.mark_local_deleted(id)?;
                    cleaned += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    self.index.mark_local_deleted(id)?;
                }
                Err(err) => {
                    log::warn!("cleanup of {} failed: {}", path, err);
                }
            }
        }
        Ok(cleaned)
    }
}

/// Handle to the running engine thread.
pub struct SyncHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("sync engine thread panicked"))?;
        }
        Ok(())
    }
}
