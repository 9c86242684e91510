//! watchpostd - edge capture daemon
//!
//! This daemon:
//! 1. Builds one capture loop per configured camera (active cameras run
//!    motion detection; passive cameras record on cross-camera triggers)
//! 2. Records motion episodes into bounded segment files with pre-motion
//!    context seeded from each camera's ring buffer
//! 3. Runs the sync engine on its own schedule to upload completed
//!    segments to the hub and clean up old local files
//! 4. Hot-reloads motion parameters when the config file changes
//! 5. Drains open segments to disk on shutdown

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use watchpost::capture::{spawn_camera_loop, CameraLoop, ControlMessage, TriggerBus};
use watchpost::config::EdgeConfig;
use watchpost::recorder::{RecorderConfig, SegmentRecorder};
use watchpost::storage::SegmentIndex;
use watchpost::sync::{SyncConfig, SyncEngine};
use watchpost::transport::HttpUploadTransport;
use watchpost::ingest;

const MOTION_RELOAD_POLL: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = EdgeConfig::load()?;
    log::info!(
        "watchpostd {} starting: {} camera(s), storage {}",
        env!("CARGO_PKG_VERSION"),
        cfg.cameras.len(),
        cfg.storage_root.display()
    );
    std::fs::create_dir_all(&cfg.storage_root)?;

    // Build the trigger fan-out before any loop starts: every loop gets a
    // sender for every other loop's control channel.
    let mut bus = TriggerBus::new();
    let mut pending = Vec::new();
    for spec in &cfg.cameras {
        let (sender, receiver) = mpsc::channel();
        bus.register(&spec.id, sender.clone());
        pending.push((spec.clone(), sender, receiver));
    }
    let bus = Arc::new(bus);

    let mut handles = Vec::new();
    for (spec, sender, receiver) in pending {
        let source = ingest::open_source(&spec)?;
        // Each loop owns its own index connection; WAL keeps writers from
        // blocking each other.
        let index = SegmentIndex::open(&cfg.db_path)?;
        let recorder = SegmentRecorder::new(
            &spec.id,
            RecorderConfig {
                motion_timeout: cfg.motion_timeout,
                max_segment_duration: cfg.max_segment_duration,
                storage_root: cfg.storage_root.clone(),
            },
            index,
        );
        let camera_loop = CameraLoop::new(
            spec,
            source,
            recorder,
            cfg.pre_motion_seconds,
            cfg.motion.clone(),
            cfg.cross_trigger_timeout,
        );
        handles.push(spawn_camera_loop(camera_loop, receiver, sender, bus.clone()));
    }

    let sync_handle = SyncEngine::new(
        SyncConfig::new(
            cfg.sync_interval,
            cfg.max_upload_attempts,
            cfg.local_retention,
        ),
        SegmentIndex::open(&cfg.db_path)?,
        Box::new(HttpUploadTransport::new(&cfg.hub_url, cfg.upload_timeout)),
    )
    .spawn();
    log::info!(
        "sync engine: every {:?} to {}, {} attempt budget",
        cfg.sync_interval,
        cfg.hub_url,
        cfg.max_upload_attempts
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::SeqCst);
    })?;

    // Main thread: wait for shutdown, polling the config file so motion
    // parameter edits reach the active loops without a restart.
    let config_path = std::env::var("WATCHPOST_CONFIG").ok().map(PathBuf::from);
    let mut last_mtime = config_path.as_deref().and_then(file_mtime);
    let mut last_poll = std::time::Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last_poll.elapsed() < MOTION_RELOAD_POLL {
            continue;
        }
        last_poll = std::time::Instant::now();
        if let Some(path) = config_path.as_deref() {
            maybe_reload_motion(path, &mut last_mtime, &handles);
        }
    }

    log::info!("shutting down: draining capture loops");
    for handle in handles {
        let camera_id = handle.camera_id.clone();
        if let Err(err) = handle.stop() {
            log::error!("camera {}: stop failed: {}", camera_id, err);
        }
    }
    sync_handle.stop()?;
    log::info!("watchpostd stopped");
    Ok(())
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn maybe_reload_motion(
    path: &Path,
    last_mtime: &mut Option<SystemTime>,
    handles: &[watchpost::capture::CameraHandle],
) {
    let Some(mtime) = file_mtime(path) else {
        return;
    };
    if Some(mtime) == *last_mtime {
        return;
    }
    *last_mtime = Some(mtime);

    match EdgeConfig::reload_motion(path) {
        Ok(settings) => {
            log::info!(
                "motion settings reloaded (sensitivity={}, min_area={})",
                settings.sensitivity,
                settings.min_area
            );
            for handle in handles {
                let _ = handle
                    .control()
                    .send(ControlMessage::Motion(settings.clone()));
            }
        }
        Err(err) => log::warn!("motion settings reload failed: {}", err),
    }
}
