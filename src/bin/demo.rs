//! demo - end-to-end run in one process
//!
//! Wires two synthetic cameras (one active, one passive) to a recorder,
//! drives motion through segment files, uploads them over the loopback
//! transport into an in-process hub queue, and processes them with the
//! stub inference backend. Everything lands in a scratch directory that
//! is printed at the end, so the artifacts can be inspected.
//!
//! Run with: cargo run --bin demo

use anyhow::Result;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use watchpost::capture::{spawn_camera_loop, CameraLoop, TriggerBus};
use watchpost::detect::MotionSettings;
use watchpost::hub::inference::StubInference;
use watchpost::hub::queue::ProcessingQueue;
use watchpost::hub::worker::{ProcessingWorker, WorkerConfig};
use watchpost::recorder::{RecorderConfig, SegmentRecorder};
use watchpost::storage::SegmentIndex;
use watchpost::sync::{SyncConfig, SyncEngine};
use watchpost::transport::LoopbackTransport;
use watchpost::{ingest, CameraRole, CameraSpec};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let root = std::env::temp_dir().join(format!("watchpost-demo-{}", std::process::id()));
    let storage_root = root.join("segments");
    let spool_root = root.join("spool");
    std::fs::create_dir_all(&storage_root)?;
    let db_path = root.join("edge.db").display().to_string();
    let hub_db_path = root.join("hub.db").display().to_string();

    let cameras = vec![
        CameraSpec {
            id: "front_door".to_string(),
            role: CameraRole::Active,
            width: 128,
            height: 96,
            fps: 20,
            source: "stub://pulse".to_string(),
        },
        CameraSpec {
            id: "back_gate".to_string(),
            role: CameraRole::Passive,
            width: 128,
            height: 96,
            fps: 20,
            source: "stub://static".to_string(),
        },
    ];

    // Short windows so the demo produces closed segments in seconds.
    let recorder_cfg = |camera_id: &str| -> Result<SegmentRecorder> {
        Ok(SegmentRecorder::new(
            camera_id,
            RecorderConfig {
                motion_timeout: Duration::from_secs(2),
                max_segment_duration: Duration::from_secs(5),
                storage_root: storage_root.clone(),
            },
            SegmentIndex::open(&db_path)?,
        ))
    };

    let mut bus = TriggerBus::new();
    let mut pending = Vec::new();
    for spec in &cameras {
        let (sender, receiver) = mpsc::channel();
        bus.register(&spec.id, sender.clone());
        pending.push((spec.clone(), sender, receiver));
    }
    let bus = Arc::new(bus);

    let mut handles = Vec::new();
    for (spec, sender, receiver) in pending {
        let source = ingest::open_source(&spec)?;
        let recorder = recorder_cfg(&spec.id)?;
        let camera_loop = CameraLoop::new(
            spec,
            source,
            recorder,
            2,
            MotionSettings::default(),
            Duration::from_secs(2),
        );
        handles.push(spawn_camera_loop(camera_loop, receiver, sender, bus.clone()));
    }

    log::info!("capturing for 12 seconds...");
    std::thread::sleep(Duration::from_secs(12));
    for handle in handles {
        handle.stop()?;
    }

    // Upload everything that closed, through the loopback transport.
    let queue = Arc::new(Mutex::new(ProcessingQueue::open(&hub_db_path, &spool_root)?));
    let mut engine = SyncEngine::new(
        SyncConfig::new(Duration::from_secs(60), 3, Duration::from_secs(3600)),
        SegmentIndex::open(&db_path)?,
        Box::new(LoopbackTransport::new(queue.clone())),
    );
    let stats = engine.run_pass()?;
    log::info!(
        "sync: {} scanned, {} uploaded, {} failed",
        stats.scanned,
        stats.uploaded,
        stats.failures
    );

    // Drain the queue with the stub inference backend.
    let mut worker = ProcessingWorker::new(
        WorkerConfig {
            frame_stride: 5,
            inference_deadline: Duration::from_secs(30),
            cluster_window: Duration::from_secs(5),
            confidence_thresholds: Default::default(),
            poll_interval: Duration::from_millis(100),
        },
        queue.clone(),
        Box::new(StubInference::new()),
    );
    while worker.run_once()? {}

    let locked = queue
        .lock()
        .map_err(|_| anyhow::anyhow!("queue lock poisoned"))?;
    for job in locked.list_jobs(20)? {
        log::info!(
            "job {}: {}/{} -> {} ({} events)",
            job.id,
            job.camera_id,
            job.start_ms,
            job.state,
            job.detection_count
        );
    }
    for (job_id, camera_id, event) in locked.list_events(20)? {
        log::info!(
            "event from job {} on {}: {} x{} conf {:.2} over {}ms",
            job_id,
            camera_id,
            event.label,
            event.count,
            event.peak_confidence,
            event.last_ms - event.first_ms
        );
    }

    log::info!("demo artifacts under {}", root.display());
    Ok(())
}
