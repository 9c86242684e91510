//! Motion detection.

mod motion;

pub use motion::{MotionDetector, MotionOutcome, MotionSettings};
