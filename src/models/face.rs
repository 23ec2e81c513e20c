use serde::{Deserialize, Serialize};

use super::media::MediaStatus;

/// Axis-aligned box in pixel coordinates of the frame it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x: x1, y: y1, width: (x2 - x1).max(0.0), height: (y2 - y1).max(0.0) }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Grow the box by `margin` of its size on every side and clamp it to a
    /// `img_w` x `img_h` image. Returns integer `(x, y, w, h)` suitable for
    /// cropping, or `None` when nothing of the box lies inside the image.
    pub fn expanded_crop(&self, margin: f32, img_w: u32, img_h: u32) -> Option<(u32, u32, u32, u32)> {
        let dx = self.width * margin;
        let dy = self.height * margin;
        let x1 = (self.x - dx).max(0.0).floor() as u32;
        let y1 = (self.y - dy).max(0.0).floor() as u32;
        let x2 = ((self.x + self.width + dx).min(img_w as f32)).ceil() as u32;
        let y2 = ((self.y + self.height + dy).min(img_h as f32)).ceil() as u32;
        let x2 = x2.min(img_w);
        let y2 = y2.min(img_h);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Raw detector output for a single frame, before it is stamped with time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl FaceBox {
    pub fn at(self, timestamp: f64) -> Detection {
        Detection { timestamp, bbox: self.bbox, confidence: self.confidence }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub timestamp: f64,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// One consolidated track, as stored in a media's face index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFace {
    pub media_id: String,
    pub track_id: u32,
    pub embedding: Vec<f32>,
    pub timestamp: f64,
    pub start_ts: f64,
    pub end_ts: f64,
    pub detection_count: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl IndexedFace {
    pub fn track_duration(&self) -> f64 {
        (self.end_ts - self.start_ts).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    NoFaceInQuery,
    NoMatch,
    NotReady,
}

/// Answer to a face search against one media asset.
///
/// `found = true` always carries `timestamp`, `distance` and `confidence`;
/// `found = false` always carries `reason`. `confidence` is a heuristic
/// linear rescaling of distance, not a calibrated probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<NoMatchReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MediaStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackSpan>,
}

/// Time span of the matched track, for scrubbing in the player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackSpan {
    pub start_ts: f64,
    pub end_ts: f64,
    pub duration: f64,
}

impl SearchResult {
    pub fn matched(face: &IndexedFace, distance: f32, confidence: f32) -> Self {
        Self {
            found: true,
            timestamp: Some(face.timestamp),
            distance: Some(distance),
            confidence: Some(confidence),
            reason: None,
            reason_code: None,
            status: None,
            track: Some(TrackSpan { start_ts: face.start_ts, end_ts: face.end_ts, duration: face.track_duration() }),
        }
    }

    fn miss(reason: String, code: NoMatchReason) -> Self {
        Self {
            found: false,
            timestamp: None,
            distance: None,
            confidence: None,
            reason: Some(reason),
            reason_code: Some(code),
            status: None,
            track: None,
        }
    }

    /// Nearest face was too far away, or the index is empty. The nearest
    /// distance is reported when there was a candidate at all.
    pub fn no_match(nearest: Option<f32>) -> Self {
        let mut r = Self::miss("No sufficiently close face in video".to_string(), NoMatchReason::NoMatch);
        r.distance = nearest;
        r
    }

    pub fn no_face() -> Self {
        Self::miss("No face detected in query image".to_string(), NoMatchReason::NoFaceInQuery)
    }

    pub fn not_ready(status: MediaStatus) -> Self {
        let mut r = Self::miss(format!("Media is not ready for search (status: {})", status), NoMatchReason::NotReady);
        r.status = Some(status);
        r
    }
}
