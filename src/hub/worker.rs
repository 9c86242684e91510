//! Background processing worker.
//!
//! A single worker drains the queue: claim, decode, sample, infer,
//! cluster, persist. Claiming goes through the queue mutex so the global
//! single-slot invariant holds even if more entry points appear later.
//!
//! Failure discipline: a job that cannot be decoded, whose inference call
//! fails, or whose inference call overruns its deadline moves to
//! `errored` and is never retried automatically; permanently corrupt
//! input must not produce an infinite retry loop. Errors stay local to
//! the job; the worker keeps draining.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::hub::cluster::cluster_detections;
use crate::hub::inference::Inference;
use crate::hub::queue::{ClaimedJob, ProcessingQueue};
use crate::segment::SegmentFile;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Sample every Nth frame into inference.
    pub frame_stride: usize,
    pub inference_deadline: Duration,
    pub cluster_window: Duration,
    pub confidence_thresholds: HashMap<String, f32>,
    /// How long to idle when the queue is empty.
    pub poll_interval: Duration,
}

pub struct ProcessingWorker {
    cfg: WorkerConfig,
    queue: Arc<Mutex<ProcessingQueue>>,
    inference: Box<dyn Inference + Send>,
}

impl ProcessingWorker {
    pub fn new(
        cfg: WorkerConfig,
        queue: Arc<Mutex<ProcessingQueue>>,
        inference: Box<dyn Inference + Send>,
    ) -> Self {
        Self {
            cfg,
            queue,
            inference,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("processing-worker".to_string())
            .spawn(move || {
                let mut worker = self;
                while !shutdown_thread.load(Ordering::SeqCst) {
                    match worker.run_once() {
                        Ok(true) => {}
                        Ok(false) => {
                            // Queue empty: idle in slices for prompt shutdown.
                            let mut remaining = worker.cfg.poll_interval;
                            while !remaining.is_zero() {
                                if shutdown_thread.load(Ordering::SeqCst) {
                                    return;
                                }
                                let slice = remaining.min(Duration::from_millis(100));
                                std::thread::sleep(slice);
                                remaining = remaining.saturating_sub(slice);
                            }
                        }
                        Err(err) => {
                            log::error!("worker pass failed: {}", err);
                            std::thread::sleep(Duration::from_millis(500));
                        }
                    }
                }
            })
            .expect("spawn worker thread");
        WorkerHandle {
            shutdown,
            join: Some(join),
        }
    }

    /// Claim and process at most one job. Returns whether a job was
    /// processed. Public so tests and the demo can drive it directly.
    pub fn run_once(&mut self) -> Result<bool> {
        let claimed = {
            let mut queue = self.lock_queue()?;
            queue.claim()?
        };
        let Some(job) = claimed else {
            return Ok(false);
        };

        match self.process(&job) {
            Ok(events) => {
                let count = events.len();
                let mut queue = self.lock_queue()?;
                queue.complete(job.id, &events)?;
                log::info!(
                    "job {} done: {} event(s) for {}/{}",
                    job.id,
                    count,
                    job.camera_id,
                    job.start_ms
                );
            }
            Err(err) => {
                let mut queue = self.lock_queue()?;
                queue.fail(job.id, &format!("{}", err))?;
                log::warn!("job {} errored: {}", job.id, err);
            }
        }
        Ok(true)
    }

    fn process(&mut self, job: &ClaimedJob) -> Result<Vec<crate::DetectionEvent>> {
        let segment = SegmentFile::read(&job.spool_path)?;

        let sampled: Vec<Frame> = segment
            .frames
            .into_iter()
            .step_by(self.cfg.frame_stride.max(1))
            .collect();
        if sampled.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let detections = self
            .inference
            .infer(&sampled, &self.cfg.confidence_thresholds)?;
        let elapsed = started.elapsed();
        if elapsed > self.cfg.inference_deadline {
            return Err(anyhow!(
                "inference deadline exceeded ({:?} > {:?})",
                elapsed,
                self.cfg.inference_deadline
            ));
        }

        Ok(cluster_detections(
            detections,
            self.cfg.cluster_window.as_millis() as u64,
        ))
    }

    fn lock_queue(&self) -> Result<std::sync::MutexGuard<'_, ProcessingQueue>> {
        self.queue
            .lock()
            .map_err(|_| anyhow!("processing queue lock poisoned"))
    }
}

pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("worker thread panicked"))?;
        }
        Ok(())
    }
}
