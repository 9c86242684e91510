//! Inference collaborator boundary.
//!
//! The object-detection model is external to this system: the worker hands
//! it a sampled frame sequence and per-class confidence floors, and gets
//! back raw detections. The call is synchronous and fallible; the worker
//! bounds it with a deadline and treats overruns as job errors.

use anyhow::Result;
use std::collections::HashMap;

use crate::frame::Frame;
use crate::{BoundingBox, RawDetection};

pub trait Inference {
    /// Run detection over sampled frames. Returned detections carry the
    /// timestamp of the frame they came from; detections below the
    /// per-class threshold must already be filtered out.
    fn infer(
        &mut self,
        frames: &[Frame],
        thresholds: &HashMap<String, f32>,
    ) -> Result<Vec<RawDetection>>;
}

/// Stand-in detector for tests and the demo: reports one "object" per
/// frame wherever bright pixels cluster, which matches what the synthetic
/// camera sources draw.
pub struct StubInference {
    brightness_floor: u8,
}

impl StubInference {
    pub fn new() -> Self {
        Self {
            brightness_floor: 128,
        }
    }
}

impl Default for StubInference {
    fn default() -> Self {
        Self::new()
    }
}

impl Inference for StubInference {
    fn infer(
        &mut self,
        frames: &[Frame],
        thresholds: &HashMap<String, f32>,
    ) -> Result<Vec<RawDetection>> {
        let threshold = thresholds.get("object").copied().unwrap_or(0.5);
        let confidence = 0.9f32;
        if confidence < threshold {
            return Ok(Vec::new());
        }

        let mut detections = Vec::new();
        for frame in frames {
            if let Some(region) = bright_region(frame, self.brightness_floor) {
                detections.push(RawDetection {
                    label: "object".to_string(),
                    confidence,
                    region,
                    timestamp_ms: frame.timestamp_ms,
                });
            }
        }
        Ok(detections)
    }
}

fn bright_region(frame: &Frame, floor: u8) -> Option<BoundingBox> {
    if !frame.is_decodable() {
        return None;
    }
    let width = frame.width as usize;
    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);
    let mut any = false;
    for (i, &px) in frame.data().iter().enumerate() {
        if px >= floor {
            let x = (i % width) as u32;
            let y = (i / width) as u32;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            any = true;
        }
    }
    if !any {
        return None;
    }
    Some(BoundingBox {
        x: min_x,
        y: min_y,
        w: max_x - min_x + 1,
        h: max_y - min_y + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_block(ts: u64) -> Frame {
        let mut data = vec![16u8; 64];
        for y in 2..4 {
            for x in 3..6 {
                data[y * 8 + x] = 200;
            }
        }
        Frame::new(ts, 8, 8, data)
    }

    #[test]
    fn stub_reports_the_bright_block() -> Result<()> {
        let mut inference = StubInference::new();
        let detections = inference.infer(&[frame_with_block(5_000)], &HashMap::new())?;
        assert_eq!(detections.len(), 1);
        let detection = &detections[0];
        assert_eq!(detection.timestamp_ms, 5_000);
        assert_eq!(
            detection.region,
            BoundingBox { x: 3, y: 2, w: 3, h: 2 }
        );
        Ok(())
    }

    #[test]
    fn dark_frames_yield_nothing() -> Result<()> {
        let mut inference = StubInference::new();
        let dark = Frame::new(0, 8, 8, vec![10u8; 64]);
        assert!(inference.infer(&[dark], &HashMap::new())?.is_empty());
        Ok(())
    }

    #[test]
    fn class_threshold_filters_detections() -> Result<()> {
        let mut inference = StubInference::new();
        let thresholds = HashMap::from([("object".to_string(), 0.95f32)]);
        let detections = inference.infer(&[frame_with_block(0)], &thresholds)?;
        assert!(detections.is_empty());
        Ok(())
    }
}
