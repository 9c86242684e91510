//! Processing queue invariants under concurrency.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use watchpost::frame::Frame;
use watchpost::hub::inference::StubInference;
use watchpost::hub::queue::{ProcessingQueue, ReceiveOutcome};
use watchpost::hub::worker::{ProcessingWorker, WorkerConfig};
use watchpost::segment::{segment_file_name, SegmentWriter};
use watchpost::transport::SegmentManifest;
use watchpost::JobState;

fn encoded_segment(
    dir: &std::path::Path,
    camera_id: &str,
    start_ms: u64,
) -> (SegmentManifest, Vec<u8>) {
    let path = dir.join(segment_file_name(camera_id, start_ms));
    let mut writer = SegmentWriter::create(&path, camera_id, start_ms).expect("writer");
    for offset in 0..6u64 {
        let mut data = vec![16u8; 64];
        for i in 27..30 {
            data[i] = 210;
        }
        writer
            .append_frame(&Frame::new(start_ms + offset * 100, 8, 8, data))
            .expect("append");
    }
    let summary = writer.finalize().expect("finalize");
    let payload = std::fs::read(&path).expect("read payload");
    (
        SegmentManifest {
            camera_id: camera_id.to_string(),
            start_ms,
            end_ms: Some(start_ms + 600),
            frame_count: summary.frame_count,
            checksum: summary.checksum,
        },
        payload,
    )
}

fn open_queue(dir: &std::path::Path) -> ProcessingQueue {
    ProcessingQueue::open(dir.join("hub.db").to_str().unwrap(), &dir.join("spool"))
        .expect("open queue")
}

#[test]
fn concurrent_claims_elect_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());
    for start in [1_000, 2_000, 3_000] {
        let (manifest, payload) = encoded_segment(dir.path(), "front_door", start);
        queue.receive(&manifest, &payload).unwrap();
    }
    let queue = Arc::new(Mutex::new(queue));

    const CLAIMERS: usize = 16;
    let barrier = Arc::new(Barrier::new(CLAIMERS));
    let mut joins = Vec::new();
    for _ in 0..CLAIMERS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        joins.push(std::thread::spawn(move || {
            barrier.wait();
            let mut locked = queue.lock().unwrap();
            locked.claim().unwrap()
        }));
    }

    let winners: Vec<_> = joins
        .into_iter()
        .map(|join| join.join().unwrap())
        .filter(|claim| claim.is_some())
        .collect();

    assert_eq!(winners.len(), 1, "exactly one claim may take the slot");
    let locked = queue.lock().unwrap();
    assert_eq!(locked.count_in_state(JobState::Processing).unwrap(), 1);
    assert_eq!(locked.count_in_state(JobState::Pending).unwrap(), 2);
}

#[test]
fn duplicate_upload_never_creates_a_second_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());
    let (manifest, payload) = encoded_segment(dir.path(), "front_door", 1_000);

    let first = queue.receive(&manifest, &payload).unwrap();
    assert!(matches!(first, ReceiveOutcome::Queued(_)));

    // Re-uploading an already-received segment is a no-op success.
    for _ in 0..3 {
        let again = queue.receive(&manifest, &payload).unwrap();
        assert!(matches!(again, ReceiveOutcome::Duplicate));
    }
    assert_eq!(queue.count_in_state(JobState::Pending).unwrap(), 1);
}

#[test]
fn duplicate_upload_after_processing_is_still_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());
    let (manifest, payload) = encoded_segment(dir.path(), "front_door", 1_000);
    queue.receive(&manifest, &payload).unwrap();

    let job = queue.claim().unwrap().expect("claim");
    queue.complete(job.id, &[]).unwrap();

    let again = queue.receive(&manifest, &payload).unwrap();
    assert!(matches!(again, ReceiveOutcome::Duplicate));
    assert_eq!(queue.count_in_state(JobState::Done).unwrap(), 1);
    assert_eq!(queue.count_in_state(JobState::Pending).unwrap(), 0);
}

#[test]
fn worker_drains_a_backlog_one_slot_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());
    for start in [1_000, 2_000, 3_000, 4_000] {
        let (manifest, payload) = encoded_segment(dir.path(), "front_door", start);
        queue.receive(&manifest, &payload).unwrap();
    }
    let queue = Arc::new(Mutex::new(queue));

    let mut worker = ProcessingWorker::new(
        WorkerConfig {
            frame_stride: 2,
            inference_deadline: Duration::from_secs(30),
            cluster_window: Duration::from_secs(5),
            confidence_thresholds: HashMap::new(),
            poll_interval: Duration::from_millis(10),
        },
        queue.clone(),
        Box::new(StubInference::new()),
    );

    let mut processed = 0;
    while worker.run_once().unwrap() {
        processed += 1;
        let locked = queue.lock().unwrap();
        assert!(
            locked.count_in_state(JobState::Processing).unwrap() == 0,
            "slot must be released between jobs"
        );
    }
    assert_eq!(processed, 4);
    let locked = queue.lock().unwrap();
    assert_eq!(locked.count_in_state(JobState::Done).unwrap(), 4);
}
