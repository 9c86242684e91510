//! Frame type and the pre-motion ring buffer.
//!
//! Each capture loop owns one `FrameRing` holding the last
//! `pre_motion_seconds x fps` frames for its camera. When a segment opens,
//! the ring is snapshot oldest-first to seed the file with lead-in context.
//!
//! The ring is single-owner by construction: only the capture loop that
//! created it ever pushes or reads.

use std::collections::VecDeque;

/// One captured frame: grayscale pixels, one byte per pixel.
#[derive(Clone, Debug)]
pub struct Frame {
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(timestamp_ms: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            timestamp_ms,
            width,
            height,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Byte length a well-formed frame of these dimensions must have.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// A frame whose payload does not match its dimensions failed to
    /// decode upstream and must be skipped, not processed.
    pub fn is_decodable(&self) -> bool {
        self.data.len() == self.expected_len()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Bounded ring of recent frames, ring semantics on overflow.
pub struct FrameRing {
    buffer: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRing {
    /// Capacity is `pre_motion_seconds x fps`, floor 1.
    pub fn new(pre_motion_seconds: u32, fps: u32) -> Self {
        let capacity = (pre_motion_seconds as usize * fps as usize).max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a frame, evicting the oldest when full.
    pub fn push(&mut self, frame: Frame) {
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
    }

    /// Snapshot oldest-first, used to seed a newly opened segment.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.buffer.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(|f| f.byte_len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u64) -> Frame {
        Frame::new(ts, 4, 4, vec![0u8; 16])
    }

    #[test]
    fn ring_evicts_oldest_on_overflow() {
        let mut ring = FrameRing::new(1, 3);
        for ts in 0..5 {
            ring.push(frame(ts));
        }
        assert_eq!(ring.len(), 3);
        let snap = ring.snapshot();
        assert_eq!(snap[0].timestamp_ms, 2);
        assert_eq!(snap[2].timestamp_ms, 4);
    }

    #[test]
    fn capacity_is_pre_motion_seconds_times_fps() {
        let ring = FrameRing::new(15, 10);
        assert_eq!(ring.capacity(), 150);
    }

    #[test]
    fn ring_holds_exactly_the_pre_motion_window() {
        // At 10 fps with a 15 s window, frame index 200 should see
        // frames 50..199 buffered ahead of it.
        let mut ring = FrameRing::new(15, 10);
        for index in 0..200u64 {
            ring.push(frame(index));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 150);
        assert_eq!(snap.first().unwrap().timestamp_ms, 50);
        assert_eq!(snap.last().unwrap().timestamp_ms, 199);
    }

    #[test]
    fn snapshot_preserves_order_oldest_first() {
        let mut ring = FrameRing::new(1, 10);
        for ts in [7, 9, 11] {
            ring.push(frame(ts));
        }
        let timestamps: Vec<u64> = ring.snapshot().iter().map(|f| f.timestamp_ms).collect();
        assert_eq!(timestamps, vec![7, 9, 11]);
    }

    #[test]
    fn undecodable_frame_is_flagged() {
        let good = Frame::new(0, 4, 4, vec![0u8; 16]);
        let truncated = Frame::new(0, 4, 4, vec![0u8; 9]);
        assert!(good.is_decodable());
        assert!(!truncated.is_decodable());
    }
}
