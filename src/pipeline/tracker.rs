//! Links per-frame face detections into temporal tracks.
//!
//! Each sampled frame is matched against the most recent detection of every
//! open track. A candidate pair costs
//!
//! ```text
//! cost = ||e_track - e_det|| + spatial_weight * (1 - IoU(box_track, box_det))
//! ```
//!
//! and is only admissible when the embedding distance and the total cost
//! both stay under their gates. Admissible pairs are assigned greedily by
//! ascending cost, which makes the result deterministic for a given input.
//! The embedding gate keeps two different people apart even when their boxes
//! cross; the gap tolerance keeps one person in one track across short
//! occlusions.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::models::face::Detection;
use crate::pipeline::embedder::euclidean_distance;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// A track with no detection for longer than this is closed.
    pub max_gap_secs: f64,
    /// Pairs further apart than this in embedding space are never linked.
    pub max_embedding_distance: f32,
    /// Weight of the `1 - IoU` term in the pair cost.
    pub spatial_weight: f32,
    /// Pairs with a total cost above this are never linked.
    pub max_cost: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_gap_secs: 2.0,
            max_embedding_distance: 1.0,
            spatial_weight: 0.5,
            max_cost: 1.25,
        }
    }
}

impl TrackerConfig {
    /// Gap tolerance given in sampled frames at `sample_fps`.
    pub fn with_gap_frames(mut self, max_gap_frames: u32, sample_fps: f32) -> Self {
        let fps = if sample_fps > 0.0 { sample_fps as f64 } else { 1.0 };
        // a gap of N missing frames spans N + 1 sampling intervals
        self.max_gap_secs = (max_gap_frames as f64 + 1.0) / fps;
        self
    }
}

/// A detection together with the embedding extracted from its crop.
#[derive(Debug, Clone)]
pub struct TrackedDetection {
    pub detection: Detection,
    pub embedding: Vec<f32>,
    /// Sharpness and size score of the crop, see
    /// [`face_quality`](crate::pipeline::embedder::face_quality).
    pub quality: f32,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub media_id: String,
    /// Ordered by strictly increasing timestamp.
    pub detections: Vec<TrackedDetection>,
}

impl Track {
    fn open(id: u32, media_id: &str, first: TrackedDetection) -> Self {
        Self { id, media_id: media_id.to_string(), detections: vec![first] }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn last(&self) -> &TrackedDetection {
        // tracks are created with one detection and only ever grow
        &self.detections[self.detections.len() - 1]
    }

    pub fn start_ts(&self) -> f64 {
        self.detections.first().map(|d| d.detection.timestamp).unwrap_or(0.0)
    }

    pub fn end_ts(&self) -> f64 {
        self.detections.last().map(|d| d.detection.timestamp).unwrap_or(0.0)
    }
}

#[derive(Debug)]
struct Candidate {
    track: usize,
    detection: usize,
    cost: f32,
    confidence: f32,
    iou: f32,
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.cost
        .total_cmp(&b.cost)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| b.iou.total_cmp(&a.iou))
        .then_with(|| a.track.cmp(&b.track))
        .then_with(|| a.detection.cmp(&b.detection))
}

pub struct FaceTracker {
    config: TrackerConfig,
    media_id: String,
    next_id: u32,
    open: Vec<Track>,
    closed: Vec<Track>,
    last_ts: Option<f64>,
}

impl FaceTracker {
    pub fn new(media_id: impl Into<String>, config: TrackerConfig) -> Self {
        Self {
            config,
            media_id: media_id.into(),
            next_id: 1,
            open: Vec::new(),
            closed: Vec::new(),
            last_ts: None,
        }
    }

    /// Feed the detections of one sampled frame. Frames must arrive in
    /// timestamp order; a frame that does not advance time is dropped.
    pub fn update(&mut self, timestamp: f64, detections: Vec<TrackedDetection>) {
        if let Some(prev) = self.last_ts {
            if timestamp <= prev {
                warn!("tracker: dropping out-of-order frame at {:.3}s (last {:.3}s)", timestamp, prev);
                return;
            }
        }
        self.last_ts = Some(timestamp);
        self.close_stale(timestamp);

        let mut candidates = Vec::new();
        for (ti, track) in self.open.iter().enumerate() {
            let last = track.last();
            for (di, det) in detections.iter().enumerate() {
                let emb_dist = euclidean_distance(&last.embedding, &det.embedding);
                if emb_dist > self.config.max_embedding_distance {
                    continue;
                }
                let iou = last.detection.bbox.iou(&det.detection.bbox);
                let cost = emb_dist + self.config.spatial_weight * (1.0 - iou);
                if cost > self.config.max_cost {
                    continue;
                }
                candidates.push(Candidate {
                    track: ti,
                    detection: di,
                    cost,
                    confidence: det.detection.confidence,
                    iou,
                });
            }
        }
        candidates.sort_by(rank);

        let mut track_taken = vec![false; self.open.len()];
        let mut assignment: Vec<Option<usize>> = vec![None; detections.len()];
        for c in &candidates {
            if track_taken[c.track] || assignment[c.detection].is_some() {
                continue;
            }
            track_taken[c.track] = true;
            assignment[c.detection] = Some(c.track);
        }

        for (det, slot) in detections.into_iter().zip(assignment) {
            let mut det = det;
            det.detection.timestamp = timestamp;
            match slot {
                Some(ti) => self.open[ti].detections.push(det),
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!("tracker: opening track {} at {:.3}s", id, timestamp);
                    self.open.push(Track::open(id, &self.media_id, det));
                }
            }
        }
    }

    fn close_stale(&mut self, now: f64) {
        // timestamps are derived from frame_index / fps, allow for rounding
        let max_gap = self.config.max_gap_secs + 1e-9;
        let (stale, live): (Vec<Track>, Vec<Track>) = std::mem::take(&mut self.open)
            .into_iter()
            .partition(|t| now - t.end_ts() > max_gap);
        for t in &stale {
            debug!("tracker: closing track {} after gap ({} detections)", t.id, t.len());
        }
        self.closed.extend(stale);
        self.open = live;
    }

    /// End of video: close every open track and return all tracks by id.
    pub fn finish(mut self) -> Vec<Track> {
        self.closed.append(&mut self.open);
        self.closed.sort_by_key(|t| t.id);
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::face::BoundingBox;

    fn det(x: f32, y: f32, conf: f32, emb: [f32; 3]) -> TrackedDetection {
        TrackedDetection {
            detection: Detection { timestamp: 0.0, bbox: BoundingBox::new(x, y, 20.0, 20.0), confidence: conf },
            embedding: emb.to_vec(),
            quality: 1.0,
        }
    }

    const RED: [f32; 3] = [1.0, 0.0, 0.0];
    const GREEN: [f32; 3] = [0.0, 1.0, 0.0];

    fn tracker() -> FaceTracker {
        // 3 fps, tolerate up to 4 missing frames
        FaceTracker::new("m1", TrackerConfig::default().with_gap_frames(4, 3.0))
    }

    fn ts(i: usize) -> f64 {
        i as f64 / 3.0
    }

    #[test]
    fn stable_face_forms_one_track() {
        let mut t = tracker();
        for i in 0..10 {
            t.update(ts(i), vec![det(50.0 + i as f32, 50.0, 0.9, RED)]);
        }
        let tracks = t.finish();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].len(), 10);
        assert_eq!(tracks[0].media_id, "m1");
    }

    #[test]
    fn short_occlusion_keeps_one_track() {
        let mut t = tracker();
        for i in 0..12 {
            // frames 4..=7 have no face: 4 missing frames
            let dets = if (4..8).contains(&i) { vec![] } else { vec![det(50.0, 50.0, 0.9, RED)] };
            t.update(ts(i), dets);
        }
        let tracks = t.finish();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].len(), 8);
    }

    #[test]
    fn long_occlusion_splits_track() {
        let mut t = tracker();
        for i in 0..16 {
            let dets = if (4..10).contains(&i) { vec![] } else { vec![det(50.0, 50.0, 0.9, RED)] };
            t.update(ts(i), dets);
        }
        let tracks = t.finish();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].len(), 4);
        assert_eq!(tracks[1].len(), 6);
    }

    #[test]
    fn crossing_people_never_merge() {
        let mut t = tracker();
        for i in 0..20 {
            let step = i as f32 * 10.0;
            // red moves right, green moves left, paths cross around frame 10
            let red = det(step, 40.0, 0.9, RED);
            let green = det(200.0 - step, 45.0, 0.9, GREEN);
            t.update(ts(i), vec![red, green]);
        }
        let tracks = t.finish();
        assert_eq!(tracks.len(), 2);
        for track in &tracks {
            let first = &track.detections[0].embedding;
            assert!(track.detections.iter().all(|d| &d.embedding == first), "track {} mixes identities", track.id);
            assert_eq!(track.len(), 20);
        }
    }

    #[test]
    fn equal_cost_prefers_higher_confidence() {
        let mut t = tracker();
        t.update(ts(0), vec![det(10.0, 10.0, 0.9, RED)]);
        t.update(ts(1), vec![det(10.0, 10.0, 0.6, RED), det(10.0, 10.0, 0.95, RED)]);
        let tracks = t.finish();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].len(), 2);
        assert!((tracks[0].detections[1].detection.confidence - 0.95).abs() < 1e-6);
        assert!((tracks[1].detections[0].detection.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn gaps_inside_tracks_respect_tolerance() {
        let cfg = TrackerConfig::default().with_gap_frames(2, 3.0);
        let max_gap = cfg.max_gap_secs;
        let mut t = FaceTracker::new("m1", cfg);
        let present = [0, 1, 2, 5, 6, 10, 11, 12, 13, 17];
        for i in 0..18 {
            let dets = if present.contains(&i) { vec![det(30.0, 30.0, 0.8, GREEN)] } else { vec![] };
            t.update(ts(i), dets);
        }
        for track in t.finish() {
            for pair in track.detections.windows(2) {
                let gap = pair[1].detection.timestamp - pair[0].detection.timestamp;
                assert!(gap > 0.0 && gap <= max_gap + 1e-9);
            }
        }
    }

    #[test]
    fn out_of_order_frames_are_ignored() {
        let mut t = tracker();
        t.update(1.0, vec![det(0.0, 0.0, 0.9, RED)]);
        t.update(0.5, vec![det(0.0, 0.0, 0.9, RED)]);
        let tracks = t.finish();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].len(), 1);
    }
}
