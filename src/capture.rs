//! Per-camera capture loops and cross-camera trigger fan-out.
//!
//! One thread per camera, each the sole owner of its frame ring, motion
//! state, and segment recorder. Loops never share mutable state: the only
//! cross-camera communication is a trigger message fanned out over each
//! loop's control channel, carrying a deadline so a late delivery is
//! discarded by a plain timestamp comparison at the receiver.
//!
//! Error discipline: everything that goes wrong inside one loop stays in
//! that loop. A frame that fails to acquire or decode is skipped; a
//! recorder failure marks the segment and capture continues. One failing
//! camera never stops the others.

use anyhow::Result;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::{MotionDetector, MotionSettings};
use crate::frame::{Frame, FrameRing};
use crate::ingest::FrameSource;
use crate::recorder::SegmentRecorder;
use crate::{now_ms, CameraRole, CameraSpec, InvariantError, TriggerMessage};

/// Messages delivered to a capture loop's control channel.
pub enum ControlMessage {
    /// Cross-camera trigger with a staleness deadline.
    Trigger(TriggerMessage),
    /// Hot-reloaded motion parameters, applied as one snapshot between
    /// frames.
    Motion(MotionSettings),
    /// Graceful drain: flush the open segment, then exit.
    Shutdown,
}

/// Fan-out of trigger messages to every registered camera loop.
///
/// Message passing instead of shared flags: the bus holds one sender per
/// loop, and a broadcast is a sequence of non-blocking sends.
pub struct TriggerBus {
    senders: Vec<(String, Sender<ControlMessage>)>,
}

impl TriggerBus {
    pub fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    pub fn register(&mut self, camera_id: &str, sender: Sender<ControlMessage>) {
        self.senders.push((camera_id.to_string(), sender));
    }

    /// Deliver a trigger to every loop except its originator.
    pub fn broadcast_from(&self, source: &str, trigger: TriggerMessage) {
        for (camera_id, sender) in &self.senders {
            if camera_id == source {
                continue;
            }
            if sender
                .send(ControlMessage::Trigger(trigger.clone()))
                .is_err()
            {
                log::debug!("trigger to {}: loop gone", camera_id);
            }
        }
    }
}

impl Default for TriggerBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running capture loop.
pub struct CameraHandle {
    pub camera_id: String,
    sender: Sender<ControlMessage>,
    join: Option<JoinHandle<()>>,
}

impl CameraHandle {
    pub fn control(&self) -> Sender<ControlMessage> {
        self.sender.clone()
    }

    /// Request a graceful drain and wait for the loop to finish flushing.
    pub fn stop(mut self) -> Result<()> {
        let _ = self.sender.send(ControlMessage::Shutdown);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow::anyhow!("camera loop thread panicked"))?;
        }
        Ok(())
    }
}

/// Everything one capture loop owns. Constructed on the spawning thread,
/// moved into the loop thread, and never shared.
pub struct CameraLoop {
    spec: CameraSpec,
    source: Box<dyn FrameSource + Send>,
    detector: Option<MotionDetector>,
    ring: FrameRing,
    recorder: SegmentRecorder,
    cross_trigger_timeout: Duration,
    motion_was_present: bool,
    last_frame_ms: u64,
}

/// What one loop iteration decided.
enum LoopStep {
    Continue,
    Shutdown,
}

impl CameraLoop {
    pub fn new(
        spec: CameraSpec,
        source: Box<dyn FrameSource + Send>,
        recorder: SegmentRecorder,
        pre_motion_seconds: u32,
        motion_settings: MotionSettings,
        cross_trigger_timeout: Duration,
    ) -> Self {
        let detector = match spec.role {
            CameraRole::Active => Some(MotionDetector::new(
                spec.width,
                spec.height,
                motion_settings,
            )),
            CameraRole::Passive => None,
        };
        let ring = FrameRing::new(pre_motion_seconds, spec.fps);
        Self {
            spec,
            source,
            detector,
            ring,
            recorder,
            cross_trigger_timeout,
            motion_was_present: false,
            last_frame_ms: 0,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.spec.id
    }

    /// Handle one control message. Returns false on shutdown.
    pub fn handle_control(&mut self, message: ControlMessage) -> bool {
        match message {
            ControlMessage::Trigger(trigger) => {
                self.on_trigger(trigger);
                true
            }
            ControlMessage::Motion(settings) => {
                if let Some(detector) = self.detector.as_mut() {
                    log::info!(
                        "camera {}: motion settings updated (sensitivity={}, min_area={})",
                        self.spec.id,
                        settings.sensitivity,
                        settings.min_area
                    );
                    detector.apply_settings(settings);
                }
                true
            }
            ControlMessage::Shutdown => false,
        }
    }

    /// Accept or discard a cross-camera trigger.
    ///
    /// Active cameras run their own detection and ignore triggers; passive
    /// cameras open a segment exactly as if they had seen motion locally,
    /// unless the deadline has already passed.
    pub fn on_trigger(&mut self, trigger: TriggerMessage) {
        if self.spec.role == CameraRole::Active {
            log::debug!(
                "camera {}: ignoring trigger from {} (active role)",
                self.spec.id,
                trigger.source_camera
            );
            return;
        }
        if trigger.is_stale(now_ms()) {
            log::debug!(
                "camera {}: dropping stale trigger from {} (deadline {} passed)",
                self.spec.id,
                trigger.source_camera,
                trigger.deadline_ms
            );
            return;
        }
        log::info!(
            "camera {}: accepted trigger from {}",
            self.spec.id,
            trigger.source_camera
        );
        if let Err(err) = self.recorder.handle_trigger(trigger.timestamp_ms, &self.ring) {
            log_loop_error(&self.spec.id, "trigger recording", &err);
        }
    }

    /// Process one captured frame: detection, trigger fan-out, recording,
    /// ring maintenance.
    pub fn step_frame(&mut self, frame: Frame, bus: &TriggerBus) {
        self.last_frame_ms = frame.timestamp_ms;

        let motion = match self.detector.as_mut() {
            Some(detector) => match detector.detect(&frame) {
                Ok(outcome) => {
                    if outcome.motion {
                        log::debug!(
                            "camera {}: motion in {} region(s)",
                            self.spec.id,
                            outcome.regions.len()
                        );
                    }
                    outcome.motion
                }
                Err(err) => {
                    // Transient decode failure: skip this frame entirely.
                    log::warn!("camera {}: skipping frame: {}", self.spec.id, err);
                    return;
                }
            },
            None => false,
        };

        // Motion rising edge fans a trigger out to the other cameras.
        if motion && !self.motion_was_present {
            let deadline_ms = now_ms() + self.cross_trigger_timeout.as_millis() as u64;
            bus.broadcast_from(
                &self.spec.id,
                TriggerMessage {
                    source_camera: self.spec.id.clone(),
                    timestamp_ms: frame.timestamp_ms,
                    deadline_ms,
                },
            );
        }
        self.motion_was_present = motion;

        if let Err(err) = self.recorder.handle_frame(&frame, motion, &self.ring) {
            log_loop_error(&self.spec.id, "recording", &err);
        }
        self.ring.push(frame);
    }

    fn drain_control(&mut self, control: &Receiver<ControlMessage>) -> LoopStep {
        loop {
            match control.try_recv() {
                Ok(message) => {
                    if !self.handle_control(message) {
                        return LoopStep::Shutdown;
                    }
                }
                Err(TryRecvError::Empty) => return LoopStep::Continue,
                Err(TryRecvError::Disconnected) => return LoopStep::Shutdown,
            }
        }
    }

    fn run(mut self, control: Receiver<ControlMessage>, bus: std::sync::Arc<TriggerBus>) {
        let frame_interval = Duration::from_millis(1000 / self.spec.fps.max(1) as u64);
        log::info!(
            "camera {}: loop running ({:?}, {})",
            self.spec.id,
            self.spec.role,
            self.source.describe()
        );

        loop {
            if matches!(self.drain_control(&control), LoopStep::Shutdown) {
                break;
            }

            match self.source.next_frame() {
                Ok(frame) => self.step_frame(frame, &bus),
                Err(err) => {
                    log::warn!("camera {}: frame acquisition failed: {}", self.spec.id, err);
                }
            }

            std::thread::sleep(frame_interval);
        }

        // Graceful drain: flush the open segment before exiting.
        let end_ms = if self.last_frame_ms > 0 {
            self.last_frame_ms
        } else {
            now_ms()
        };
        if let Err(err) = self.recorder.shutdown(end_ms) {
            log::error!("camera {}: drain failed: {}", self.spec.id, err);
        }
        log::info!("camera {}: loop stopped", self.spec.id);
    }
}

/// Spawn a capture loop on its own thread.
pub fn spawn_camera_loop(
    camera_loop: CameraLoop,
    control: Receiver<ControlMessage>,
    sender: Sender<ControlMessage>,
    bus: std::sync::Arc<TriggerBus>,
) -> CameraHandle {
    let camera_id = camera_loop.camera_id().to_string();
    let thread_name = format!("capture-{}", camera_id);
    let join = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || camera_loop.run(control, bus))
        .expect("spawn capture thread");
    CameraHandle {
        camera_id,
        sender,
        join: Some(join),
    }
}

fn log_loop_error(camera_id: &str, what: &str, err: &anyhow::Error) {
    if err.downcast_ref::<InvariantError>().is_some() {
        log::error!("camera {}: {} rejected: {}", camera_id, what, err);
    } else {
        log::warn!("camera {}: {} degraded: {}", camera_id, what, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecorderConfig;
    use crate::storage::SegmentIndex;

    fn passive_loop(dir: &std::path::Path) -> CameraLoop {
        let spec = CameraSpec {
            id: "back_gate".to_string(),
            role: CameraRole::Passive,
            width: 128,
            height: 96,
            fps: 10,
            source: "stub://static".to_string(),
        };
        let source = crate::ingest::open_source(&spec).unwrap();
        let recorder = SegmentRecorder::new(
            &spec.id,
            RecorderConfig {
                motion_timeout: Duration::from_secs(30),
                max_segment_duration: Duration::from_secs(300),
                storage_root: dir.to_path_buf(),
            },
            SegmentIndex::open(":memory:").unwrap(),
        );
        CameraLoop::new(
            spec,
            source,
            recorder,
            5,
            MotionSettings::default(),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn fresh_trigger_opens_a_segment_on_the_passive_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera_loop = passive_loop(dir.path());
        camera_loop.on_trigger(TriggerMessage {
            source_camera: "front_door".to_string(),
            timestamp_ms: now_ms(),
            deadline_ms: now_ms() + 2_000,
        });
        assert!(camera_loop.recorder.is_open());
    }

    #[test]
    fn stale_trigger_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera_loop = passive_loop(dir.path());
        camera_loop.on_trigger(TriggerMessage {
            source_camera: "front_door".to_string(),
            timestamp_ms: now_ms() - 5_000,
            deadline_ms: now_ms() - 1,
        });
        assert!(!camera_loop.recorder.is_open());
    }

    #[test]
    fn bus_skips_the_originating_camera() {
        let mut bus = TriggerBus::new();
        let (tx_a, rx_a) = std::sync::mpsc::channel();
        let (tx_b, rx_b) = std::sync::mpsc::channel();
        bus.register("front_door", tx_a);
        bus.register("back_gate", tx_b);

        bus.broadcast_from(
            "front_door",
            TriggerMessage {
                source_camera: "front_door".to_string(),
                timestamp_ms: 1,
                deadline_ms: 2,
            },
        );

        assert!(rx_a.try_recv().is_err(), "source must not self-trigger");
        assert!(matches!(
            rx_b.try_recv(),
            Ok(ControlMessage::Trigger(_))
        ));
    }

    #[test]
    fn shutdown_message_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera_loop = passive_loop(dir.path());
        assert!(!camera_loop.handle_control(ControlMessage::Shutdown));
        assert!(camera_loop.handle_control(ControlMessage::Motion(MotionSettings::default())));
    }
}
