//! Detection clustering.
//!
//! A single inference pass over a segment produces many raw detections of
//! the same physical occurrence: one per sampled frame, drifting slightly.
//! Clustering folds them into displayable events by temporal proximity
//! (within the configured window of the cluster's most recent detection)
//! and spatial overlap (the detection's box must intersect the cluster's
//! running union box). Detections of different labels never merge.

use crate::{BoundingBox, DetectionEvent, RawDetection};

struct Cluster {
    label: String,
    count: u32,
    first_ms: u64,
    last_ms: u64,
    peak_confidence: f32,
    region: BoundingBox,
}

impl Cluster {
    fn from_detection(detection: &RawDetection) -> Self {
        Self {
            label: detection.label.clone(),
            count: 1,
            first_ms: detection.timestamp_ms,
            last_ms: detection.timestamp_ms,
            peak_confidence: detection.confidence,
            region: detection.region,
        }
    }

    fn accepts(&self, detection: &RawDetection, window_ms: u64) -> bool {
        self.label == detection.label
            && detection.timestamp_ms.saturating_sub(self.last_ms) <= window_ms
            && detection.region.intersects(&self.region)
    }

    fn absorb(&mut self, detection: &RawDetection) {
        self.count += 1;
        self.last_ms = self.last_ms.max(detection.timestamp_ms);
        self.peak_confidence = self.peak_confidence.max(detection.confidence);
        self.region = self.region.union(&detection.region);
    }

    fn into_event(self) -> DetectionEvent {
        DetectionEvent {
            label: self.label,
            count: self.count,
            first_ms: self.first_ms,
            last_ms: self.last_ms,
            peak_confidence: self.peak_confidence,
            region: self.region,
        }
    }
}

/// Fold raw detections into events. The input order does not matter;
/// detections are processed in timestamp order.
pub fn cluster_detections(
    mut detections: Vec<RawDetection>,
    window_ms: u64,
) -> Vec<DetectionEvent> {
    detections.sort_by_key(|d| d.timestamp_ms);

    let mut clusters: Vec<Cluster> = Vec::new();
    for detection in &detections {
        match clusters
            .iter_mut()
            .find(|cluster| cluster.accepts(detection, window_ms))
        {
            Some(cluster) => cluster.absorb(detection),
            None => clusters.push(Cluster::from_detection(detection)),
        }
    }

    clusters.into_iter().map(Cluster::into_event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(ts_ms: u64, x: u32, label: &str) -> RawDetection {
        RawDetection {
            label: label.to_string(),
            confidence: 0.8,
            region: BoundingBox { x, y: 10, w: 20, h: 20 },
            timestamp_ms: ts_ms,
        }
    }

    #[test]
    fn nearby_overlapping_detections_form_one_event() {
        // 10.0 s and 10.8 s, boxes overlapping: one event, count 2.
        let events = cluster_detections(
            vec![detection(10_000, 40, "person"), detection(10_800, 45, "person")],
            5_000,
        );
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.count, 2);
        assert_eq!(event.first_ms, 10_000);
        assert_eq!(event.last_ms, 10_800);
    }

    #[test]
    fn detections_a_minute_apart_never_cluster() {
        let events = cluster_detections(
            vec![detection(10_000, 40, "person"), detection(70_000, 40, "person")],
            5_000,
        );
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.count == 1));
    }

    #[test]
    fn spatially_disjoint_detections_stay_separate() {
        let events = cluster_detections(
            vec![detection(10_000, 0, "person"), detection(10_100, 500, "person")],
            5_000,
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn labels_never_merge() {
        let events = cluster_detections(
            vec![detection(10_000, 40, "person"), detection(10_100, 42, "vehicle")],
            5_000,
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn window_chains_off_the_most_recent_detection() {
        // Each detection is 3 s after the previous; with a 5 s window the
        // chain holds even though first and last are 9 s apart.
        let events = cluster_detections(
            vec![
                detection(0, 40, "person"),
                detection(3_000, 41, "person"),
                detection(6_000, 42, "person"),
                detection(9_000, 43, "person"),
            ],
            5_000,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].count, 4);
    }

    #[test]
    fn peak_confidence_and_union_region_are_kept() {
        let mut a = detection(1_000, 40, "person");
        a.confidence = 0.6;
        let mut b = detection(1_500, 50, "person");
        b.confidence = 0.95;
        let events = cluster_detections(vec![a, b], 5_000);
        assert_eq!(events.len(), 1);
        assert!((events[0].peak_confidence - 0.95).abs() < f32::EPSILON);
        assert_eq!(events[0].region, BoundingBox { x: 40, y: 10, w: 30, h: 20 });
    }
}
