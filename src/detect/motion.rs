//! Background-subtraction motion detector.
//!
//! The detector keeps a per-pixel running-average background model blended
//! with a small learning rate on every frame, so gradual lighting changes
//! never register as motion. The difference mask is thresholded against the
//! configured sensitivity, connected regions below the minimum area are
//! discarded as noise, and an optional region-of-interest mask restricts
//! which pixels participate at all.
//!
//! The model is a value owned by one capture loop. Configuration changes
//! arrive as an immutable `MotionSettings` snapshot swapped in between
//! frames; a detection call never observes a partial update.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::frame::Frame;
use crate::BoundingBox;

/// Background blend factor. Small enough that slow lighting drift folds
/// into the model within a few seconds at typical frame rates.
const LEARNING_RATE: f32 = 0.05;

/// Runtime-tunable detection parameters. Replaced as a whole snapshot,
/// effective from the next frame evaluation.
#[derive(Clone, Debug, Deserialize)]
pub struct MotionSettings {
    /// Per-pixel absolute difference required to mark a pixel as changed.
    pub sensitivity: f32,
    /// Connected regions smaller than this many pixels are noise.
    pub min_area: u32,
    /// Detection is restricted to this rectangle when set; pixels outside
    /// are ignored entirely.
    pub roi: Option<BoundingBox>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            sensitivity: 25.0,
            min_area: 64,
            roi: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MotionOutcome {
    pub motion: bool,
    pub regions: Vec<BoundingBox>,
}

pub struct MotionDetector {
    width: u32,
    height: u32,
    settings: MotionSettings,
    background: Vec<f32>,
    primed: bool,
}

impl MotionDetector {
    pub fn new(width: u32, height: u32, settings: MotionSettings) -> Self {
        Self {
            width,
            height,
            settings,
            background: vec![0.0; width as usize * height as usize],
            primed: false,
        }
    }

    /// Swap in a new settings snapshot. Takes effect on the next
    /// `detect` call, never retroactively.
    pub fn apply_settings(&mut self, settings: MotionSettings) {
        self.settings = settings;
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    /// Classify one frame.
    ///
    /// A frame that cannot be decoded is an error: the caller skips it and
    /// the background model is left untouched.
    pub fn detect(&mut self, frame: &Frame) -> Result<MotionOutcome> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame dimensions {}x{} do not match detector {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        if !frame.is_decodable() {
            return Err(anyhow!(
                "frame decode failure: {} bytes for {}x{}",
                frame.byte_len(),
                frame.width,
                frame.height
            ));
        }

        let data = frame.data();

        // First valid frame seeds the model and reports no motion.
        if !self.primed {
            for (bg, &px) in self.background.iter_mut().zip(data) {
                *bg = px as f32;
            }
            self.primed = true;
            return Ok(MotionOutcome::default());
        }

        let width = self.width as usize;
        let roi = self.settings.roi;
        let sensitivity = self.settings.sensitivity;

        let mut mask = vec![false; data.len()];
        for (i, &px) in data.iter().enumerate() {
            if let Some(roi) = roi {
                let x = (i % width) as u32;
                let y = (i / width) as u32;
                if !roi.contains(x, y) {
                    continue;
                }
            }
            if (px as f32 - self.background[i]).abs() > sensitivity {
                mask[i] = true;
            }
        }

        // Blend the frame into the model after differencing, so the frame
        // being evaluated is compared against the prior background.
        for (bg, &px) in self.background.iter_mut().zip(data) {
            *bg = px as f32 * LEARNING_RATE + *bg * (1.0 - LEARNING_RATE);
        }

        let regions =
            connected_regions(&mask, self.width, self.height, self.settings.min_area);
        Ok(MotionOutcome {
            motion: !regions.is_empty(),
            regions,
        })
    }
}

/// Collect bounding boxes of 4-connected changed-pixel regions at or above
/// the minimum area.
fn connected_regions(mask: &[bool], width: u32, height: u32, min_area: u32) -> Vec<BoundingBox> {
    let width = width as usize;
    let height = height as usize;
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }

        let mut area = 0u32;
        let (mut min_x, mut min_y) = (width, height);
        let (mut max_x, mut max_y) = (0usize, 0usize);

        visited[start] = true;
        stack.push(start);
        while let Some(index) = stack.pop() {
            area += 1;
            let x = index % width;
            let y = index / width;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            if x > 0 {
                push_if_set(mask, &mut visited, &mut stack, index - 1);
            }
            if x + 1 < width {
                push_if_set(mask, &mut visited, &mut stack, index + 1);
            }
            if y > 0 {
                push_if_set(mask, &mut visited, &mut stack, index - width);
            }
            if y + 1 < height {
                push_if_set(mask, &mut visited, &mut stack, index + width);
            }
        }

        if area >= min_area {
            regions.push(BoundingBox {
                x: min_x as u32,
                y: min_y as u32,
                w: (max_x - min_x + 1) as u32,
                h: (max_y - min_y + 1) as u32,
            });
        }
    }

    regions
}

fn push_if_set(mask: &[bool], visited: &mut [bool], stack: &mut Vec<usize>, index: usize) {
    if mask[index] && !visited[index] {
        visited[index] = true;
        stack.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 32;
    const H: u32 = 24;

    fn flat_frame(ts: u64, level: u8) -> Frame {
        Frame::new(ts, W, H, vec![level; (W * H) as usize])
    }

    /// Flat background with a bright square painted on top.
    fn frame_with_block(ts: u64, bx: u32, by: u32, size: u32) -> Frame {
        let mut data = vec![16u8; (W * H) as usize];
        for y in by..(by + size).min(H) {
            for x in bx..(bx + size).min(W) {
                data[(y * W + x) as usize] = 200;
            }
        }
        Frame::new(ts, W, H, data)
    }

    fn settings(min_area: u32) -> MotionSettings {
        MotionSettings {
            sensitivity: 25.0,
            min_area,
            roi: None,
        }
    }

    #[test]
    fn static_scene_reports_no_motion() -> Result<()> {
        let mut detector = MotionDetector::new(W, H, settings(16));
        for ts in 0..10 {
            let outcome = detector.detect(&flat_frame(ts, 16))?;
            assert!(!outcome.motion);
        }
        Ok(())
    }

    #[test]
    fn appearing_block_reports_motion_with_region() -> Result<()> {
        let mut detector = MotionDetector::new(W, H, settings(16));
        detector.detect(&flat_frame(0, 16))?;
        let outcome = detector.detect(&frame_with_block(1, 8, 6, 8))?;
        assert!(outcome.motion);
        assert_eq!(outcome.regions.len(), 1);
        let region = outcome.regions[0];
        assert_eq!((region.x, region.y), (8, 6));
        assert_eq!((region.w, region.h), (8, 8));
        Ok(())
    }

    #[test]
    fn regions_below_min_area_are_noise() -> Result<()> {
        let mut detector = MotionDetector::new(W, H, settings(16));
        detector.detect(&flat_frame(0, 16))?;
        // 3x3 block = 9 pixels, below min_area 16.
        let outcome = detector.detect(&frame_with_block(1, 4, 4, 3))?;
        assert!(!outcome.motion);
        assert!(outcome.regions.is_empty());
        Ok(())
    }

    #[test]
    fn roi_mask_ignores_pixels_outside() -> Result<()> {
        let mut detector = MotionDetector::new(
            W,
            H,
            MotionSettings {
                sensitivity: 25.0,
                min_area: 16,
                roi: Some(BoundingBox { x: 0, y: 0, w: 8, h: 8 }),
            },
        );
        detector.detect(&flat_frame(0, 16))?;
        // Block entirely outside the ROI.
        let outcome = detector.detect(&frame_with_block(1, 20, 12, 8))?;
        assert!(!outcome.motion);
        Ok(())
    }

    #[test]
    fn settings_swap_takes_effect_next_frame() -> Result<()> {
        let mut detector = MotionDetector::new(W, H, settings(200));
        detector.detect(&flat_frame(0, 16))?;
        // 8x8 = 64 pixels, under the 200-pixel floor.
        assert!(!detector.detect(&frame_with_block(1, 8, 6, 8))?.motion);

        detector.apply_settings(settings(16));
        assert!(detector.detect(&frame_with_block(2, 8, 6, 8))?.motion);
        Ok(())
    }

    #[test]
    fn decode_failure_skips_model_update() -> Result<()> {
        let mut detector = MotionDetector::new(W, H, settings(16));
        detector.detect(&flat_frame(0, 16))?;

        let truncated = Frame::new(1, W, H, vec![16u8; 10]);
        assert!(detector.detect(&truncated).is_err());

        // The model must be unchanged: an identical background frame still
        // reports no motion.
        let outcome = detector.detect(&flat_frame(2, 16))?;
        assert!(!outcome.motion);
        Ok(())
    }

    #[test]
    fn gradual_lighting_drift_folds_into_background() -> Result<()> {
        let mut detector = MotionDetector::new(W, H, settings(16));
        detector.detect(&flat_frame(0, 100))?;
        // Brighten the whole scene by one level per frame; no single step
        // exceeds the sensitivity threshold.
        let mut level = 100u8;
        for ts in 1..60 {
            level = level.saturating_add(1);
            let outcome = detector.detect(&flat_frame(ts, level))?;
            assert!(!outcome.motion, "drift misread as motion at ts {}", ts);
        }
        Ok(())
    }
}
