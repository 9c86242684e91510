//! Sync engine behavior against a controllable transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use watchpost::frame::Frame;
use watchpost::hub::queue::ProcessingQueue;
use watchpost::segment::{segment_file_name, SegmentWriter};
use watchpost::storage::SegmentIndex;
use watchpost::sync::{SyncConfig, SyncEngine};
use watchpost::transport::{
    LoopbackTransport, SegmentManifest, UploadOutcome, UploadTransport,
};
use watchpost::{JobState, SegmentState};

/// Transport that fails a configurable number of times before accepting,
/// recording every call.
struct FlakyTransport {
    failures_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyTransport {
    fn new(failures: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

/// Newtype so `UploadTransport` can be implemented for a shared handle
/// without running afoul of the orphan rule (`Arc` is foreign to this crate).
struct SharedFlaky(Arc<FlakyTransport>);

impl UploadTransport for SharedFlaky {
    fn upload(&self, _manifest: &SegmentManifest, _payload: &[u8]) -> Result<UploadOutcome> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.0.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.0.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("connection refused"));
        }
        Ok(UploadOutcome::Accepted)
    }
}

/// Write a real segment file and register it as pending upload.
fn pending_segment(
    dir: &std::path::Path,
    index: &mut SegmentIndex,
    camera_id: &str,
    start_ms: u64,
) -> i64 {
    let path = dir.join(segment_file_name(camera_id, start_ms));
    let mut writer = SegmentWriter::create(&path, camera_id, start_ms).expect("writer");
    for offset in 0..4u64 {
        writer
            .append_frame(&Frame::new(start_ms + offset * 100, 8, 6, vec![3u8; 48]))
            .expect("append");
    }
    let summary = writer.finalize().expect("finalize");

    let id = index
        .open_segment(camera_id, start_ms, &path.display().to_string())
        .expect("open");
    index
        .close_segment(id, start_ms + 400, summary.frame_count, &summary.checksum)
        .expect("close");
    index.mark_pending_upload(id).expect("pending");
    id
}

fn fast_config(max_attempts: u32) -> SyncConfig {
    SyncConfig {
        interval: Duration::from_secs(3600),
        max_attempts,
        local_retention: Duration::from_secs(3600),
        backoff_base: Duration::from_millis(0),
        backoff_cap: Duration::from_millis(0),
    }
}

#[test]
fn failed_uploads_retry_until_the_transport_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut index = SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap();
    let id = pending_segment(dir.path(), &mut index, "front_door", 1_000);

    let transport = Arc::new(FlakyTransport::new(2));
    let mut engine = SyncEngine::new(
        fast_config(8),
        SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap(),
        Box::new(SharedFlaky(transport.clone())),
    );

    // Two failing passes, then success on the third. The short sleeps
    // let the (near-zero) backoff expire between passes.
    let stats = engine.run_pass().unwrap();
    assert_eq!(stats.failures, 1);
    std::thread::sleep(Duration::from_millis(10));
    let stats = engine.run_pass().unwrap();
    assert_eq!(stats.failures, 1);
    std::thread::sleep(Duration::from_millis(10));
    let stats = engine.run_pass().unwrap();
    assert_eq!(stats.uploaded, 1);

    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    let record = index.get(id).unwrap();
    assert_eq!(record.state, SegmentState::Uploaded);
    assert_eq!(record.attempts, 2);
}

#[test]
fn exhausted_retry_budget_parks_the_segment_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut index = SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap();
    let id = pending_segment(dir.path(), &mut index, "front_door", 1_000);

    let transport = Arc::new(FlakyTransport::new(usize::MAX));
    let mut engine = SyncEngine::new(
        fast_config(2),
        SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap(),
        Box::new(SharedFlaky(transport.clone())),
    );

    engine.run_pass().unwrap();
    std::thread::sleep(Duration::from_millis(10));
    engine.run_pass().unwrap();

    let record = index.get(id).unwrap();
    assert_eq!(record.state, SegmentState::Failed, "parked after budget");
    assert_eq!(record.attempts, 2);
    assert!(record.last_error.is_some());

    // Parked segments are still retried on the next scheduled pass, so a
    // recovered transport eventually drains them.
    transport.failures_remaining.store(0, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(10));
    engine.run_pass().unwrap();
    assert_eq!(index.get(id).unwrap().state, SegmentState::Uploaded);
}

#[test]
fn missing_segment_file_is_a_permanent_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut index = SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap();
    let id = pending_segment(dir.path(), &mut index, "front_door", 1_000);
    std::fs::remove_file(dir.path().join(segment_file_name("front_door", 1_000))).unwrap();

    let transport = Arc::new(FlakyTransport::new(0));
    let mut engine = SyncEngine::new(
        fast_config(8),
        SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap(),
        Box::new(SharedFlaky(transport.clone())),
    );
    engine.run_pass().unwrap();

    assert_eq!(transport.calls.load(Ordering::SeqCst), 0, "nothing to send");
    let record = index.get(id).unwrap();
    assert_eq!(record.state, SegmentState::Failed);

    // And it is not scanned again on later passes.
    engine.run_pass().unwrap();
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn uploaded_files_are_deleted_after_retention() {
    let dir = tempfile::tempdir().unwrap();
    let mut index = SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap();
    let id = pending_segment(dir.path(), &mut index, "front_door", 1_000);
    let path = dir.path().join(segment_file_name("front_door", 1_000));

    let transport = Arc::new(FlakyTransport::new(0));
    let mut engine = SyncEngine::new(
        SyncConfig {
            interval: Duration::from_secs(3600),
            max_attempts: 8,
            // Zero retention: eligible for cleanup immediately after upload.
            local_retention: Duration::from_millis(0),
            backoff_base: Duration::from_millis(0),
            backoff_cap: Duration::from_millis(0),
        },
        SegmentIndex::open(dir.path().join("edge.db").to_str().unwrap()).unwrap(),
        Box::new(SharedFlaky(transport)),
    );

    engine.run_pass().unwrap();
    assert_eq!(index.get(id).unwrap().state, SegmentState::Uploaded);
    assert!(path.exists(), "file outlives the upload pass");

    std::thread::sleep(Duration::from_millis(5));
    let stats = engine.run_pass().unwrap();
    assert_eq!(stats.cleaned, 1);
    assert!(!path.exists(), "file removed once retention expired");
    let record = index.get(id).unwrap();
    assert_eq!(record.state, SegmentState::Uploaded, "row kept for operators");
    assert!(record.local_file_deleted);
}

#[test]
fn reupload_through_loopback_is_idempotent_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("edge.db");
    let mut index = SegmentIndex::open(db.to_str().unwrap()).unwrap();
    let id = pending_segment(dir.path(), &mut index, "front_door", 1_000);

    let queue = Arc::new(Mutex::new(
        ProcessingQueue::open(dir.path().join("hub.db").to_str().unwrap(), &dir.path().join("spool"))
            .unwrap(),
    ));
    let mut engine = SyncEngine::new(
        fast_config(8),
        SegmentIndex::open(db.to_str().unwrap()).unwrap(),
        Box::new(LoopbackTransport::new(queue.clone())),
    );

    let stats = engine.run_pass().unwrap();
    assert_eq!(stats.uploaded, 1);
    assert_eq!(
        queue.lock().unwrap().count_in_state(JobState::Pending).unwrap(),
        1
    );

    // Force the edge to believe the segment still needs uploading; the
    // receiver must treat the re-send as a no-op duplicate and the edge
    // must complete the segment without queueing a second job.
    index.record_attempt(id, 0, "simulated loss of ack", 0, false).unwrap();
    let stats = engine.run_pass().unwrap();
    assert_eq!(stats.duplicates, 1);
    assert_eq!(index.get(id).unwrap().state, SegmentState::Uploaded);
    assert_eq!(
        queue.lock().unwrap().count_in_state(JobState::Pending).unwrap(),
        1,
        "no duplicate processing job"
    );
}
