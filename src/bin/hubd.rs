//! hubd - segment processing hub daemon
//!
//! This daemon:
//! 1. Listens for segment uploads and queues them durably before
//!    acknowledging (an acked segment survives a crash)
//! 2. Runs the single processing worker: decode, sample, infer, cluster,
//!    persist
//! 3. Sweeps expired jobs and detection events on the retention schedule
//! 4. Serves `/jobs` and `/events` so operators can inspect terminal
//!    failures without log access

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use watchpost::config::HubConfig;
use watchpost::hub::inference::StubInference;
use watchpost::hub::queue::ProcessingQueue;
use watchpost::hub::server::{HubServer, HubServerConfig};
use watchpost::hub::worker::{ProcessingWorker, WorkerConfig};
use watchpost::now_ms;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = HubConfig::load()?;
    log::info!(
        "hubd {} starting: db {}, spool {}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path,
        cfg.spool_root.display()
    );

    let queue = Arc::new(Mutex::new(ProcessingQueue::open(
        &cfg.db_path,
        &cfg.spool_root,
    )?));

    let server_handle = HubServer::new(
        HubServerConfig {
            addr: cfg.listen_addr.clone(),
        },
        queue.clone(),
    )
    .spawn()?;
    log::info!("hub receiver listening on {}", server_handle.addr);

    // The inference collaborator is external; the built-in stub stands in
    // for deployments without a model endpoint wired up.
    let worker_handle = ProcessingWorker::new(
        WorkerConfig {
            frame_stride: cfg.frame_stride,
            inference_deadline: cfg.inference_deadline,
            cluster_window: cfg.cluster_window,
            confidence_thresholds: cfg.confidence_thresholds.clone(),
            poll_interval: Duration::from_millis(500),
        },
        queue.clone(),
        Box::new(StubInference::new()),
    )
    .spawn();
    log::info!(
        "processing worker: stride {}, deadline {:?}, cluster window {:?}",
        cfg.frame_stride,
        cfg.inference_deadline,
        cfg.cluster_window
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::SeqCst);
    })?;

    let mut last_sweep = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last_sweep.elapsed() >= RETENTION_SWEEP_INTERVAL {
            last_sweep = Instant::now();
            let mut locked = match queue.lock() {
                Ok(locked) => locked,
                Err(_) => break,
            };
            if let Err(err) = locked.retention_sweep(
                now_ms(),
                cfg.detection_retention.as_millis() as u64,
                cfg.no_detection_retention.as_millis() as u64,
            ) {
                log::error!("retention sweep failed: {}", err);
            }
        }
    }

    log::info!("shutting down hub");
    worker_handle.stop()?;
    server_handle.stop()?;
    log::info!("hubd stopped");
    Ok(())
}
