//! Synthetic frame source.
//!
//! Generates a flat grayscale scene with a bright block that moves on a
//! scripted schedule, giving the motion detector something real to find.
//! Frame timestamps advance by exactly one frame interval per call, so
//! downstream timing (pre-roll, timeouts, duration caps) is deterministic.
//!
//! Recognized URLs:
//! - `stub://static`  - the block never moves; no motion is ever detected
//! - `stub://pulse`   - the block moves for 10 frames out of every 100
//! - `stub://walker`  - the block drifts continuously

use anyhow::{bail, Result};

use crate::frame::Frame;
use crate::{now_ms, CameraSpec};

const BACKGROUND_LEVEL: u8 = 16;
const BLOCK_LEVEL: u8 = 200;
const BLOCK_SIZE: u32 = 24;

const PULSE_PERIOD: u64 = 100;
const PULSE_ACTIVE: u64 = 10;

enum Script {
    Static,
    Pulse,
    Walker,
}

pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval_ms: u64,
    script: Script,
    frame_index: u64,
    start_ms: u64,
    block_x: u32,
}

impl SyntheticSource {
    pub fn new(spec: &CameraSpec) -> Result<Self> {
        let script = match spec.source.as_str() {
            "stub://static" => Script::Static,
            "stub://pulse" => Script::Pulse,
            "stub://walker" => Script::Walker,
            other => bail!("unknown synthetic source '{}'", other),
        };
        if spec.fps == 0 {
            bail!("synthetic source requires fps > 0");
        }
        log::info!(
            "camera {}: synthetic source {} at {}x{}@{}fps",
            spec.id,
            spec.source,
            spec.width,
            spec.height,
            spec.fps
        );
        Ok(Self {
            width: spec.width,
            height: spec.height,
            frame_interval_ms: 1000 / spec.fps as u64,
            script,
            frame_index: 0,
            start_ms: now_ms(),
            block_x: 0,
        })
    }

    fn advance_block(&mut self) {
        let travel = self.width.saturating_sub(BLOCK_SIZE).max(1);
        match self.script {
            Script::Static => {}
            Script::Walker => {
                self.block_x = (self.block_x + 2) % travel;
            }
            Script::Pulse => {
                if self.frame_index % PULSE_PERIOD < PULSE_ACTIVE {
                    self.block_x = (self.block_x + 4) % travel;
                }
            }
        }
    }
}

impl crate::ingest::FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Frame> {
        self.advance_block();

        let mut data = vec![BACKGROUND_LEVEL; (self.width * self.height) as usize];
        let top = self.height / 4;
        for y in top..(top + BLOCK_SIZE).min(self.height) {
            for x in self.block_x..(self.block_x + BLOCK_SIZE).min(self.width) {
                data[(y * self.width + x) as usize] = BLOCK_LEVEL;
            }
        }

        let timestamp_ms = self.start_ms + self.frame_index * self.frame_interval_ms;
        self.frame_index += 1;
        Ok(Frame::new(timestamp_ms, self.width, self.height, data))
    }

    fn describe(&self) -> String {
        let script = match self.script {
            Script::Static => "static",
            Script::Pulse => "pulse",
            Script::Walker => "walker",
        };
        format!("stub://{} {}x{}", script, self.width, self.height)
    }
}
