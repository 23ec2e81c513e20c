use std::fmt;
use std::str::FromStr;

use crate::models::face::IndexedFace;
use crate::pipeline::embedder::l2_normalize;
use crate::pipeline::tracker::{Track, TrackedDetection};

/// How a track is reduced to one searchable embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepresentativePolicy {
    /// Embedding and timestamp of the most confident detection.
    BestFrame,
    /// Detection closest to the middle of the track.
    TemporalMidpoint,
    /// Normalized mean of the K most confident embeddings, timestamped at
    /// the most confident one.
    TopKMean(usize),
    /// Embedding and timestamp of the sharpest, largest crop.
    BestQuality,
    /// Normalized mean of the K best-quality embeddings, timestamped at the
    /// best-quality one.
    TopQualityMean(usize),
}

impl Default for RepresentativePolicy {
    fn default() -> Self {
        RepresentativePolicy::BestFrame
    }
}

impl fmt::Display for RepresentativePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepresentativePolicy::BestFrame => f.write_str("best"),
            RepresentativePolicy::TemporalMidpoint => f.write_str("midpoint"),
            RepresentativePolicy::TopKMean(k) => write!(f, "top:{}", k),
            RepresentativePolicy::BestQuality => f.write_str("quality"),
            RepresentativePolicy::TopQualityMean(k) => write!(f, "top-quality:{}", k),
        }
    }
}

impl FromStr for RepresentativePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "best" | "best-frame" | "best_frame" => Ok(RepresentativePolicy::BestFrame),
            "midpoint" | "temporal-midpoint" => Ok(RepresentativePolicy::TemporalMidpoint),
            "quality" | "best-quality" => Ok(RepresentativePolicy::BestQuality),
            other => {
                if let Some(k) = other.strip_prefix("top-quality:") {
                    return Ok(RepresentativePolicy::TopQualityMean(parse_k(k, other)?));
                }
                let k = other
                    .strip_prefix("top:")
                    .ok_or_else(|| anyhow::anyhow!("unknown representative policy '{}'", other))?;
                Ok(RepresentativePolicy::TopKMean(parse_k(k, other)?))
            }
        }
    }
}

fn parse_k(k: &str, policy: &str) -> anyhow::Result<usize> {
    let k: usize = k.parse().map_err(|_| anyhow::anyhow!("invalid K in '{}'", policy))?;
    if k == 0 {
        anyhow::bail!("{} needs K >= 1", policy);
    }
    Ok(k)
}

#[derive(Debug, Clone)]
pub struct ConsolidatorConfig {
    /// Tracks with fewer detections are dropped as noise.
    pub min_detections: usize,
    pub policy: RepresentativePolicy,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self { min_detections: 3, policy: RepresentativePolicy::BestFrame }
    }
}

fn confidence(d: &TrackedDetection) -> f32 {
    d.detection.confidence
}

fn quality(d: &TrackedDetection) -> f32 {
    d.quality
}

fn best_by(dets: &[TrackedDetection], score: fn(&TrackedDetection) -> f32) -> Option<&TrackedDetection> {
    // earliest wins on equal score
    dets.iter().fold(None, |best: Option<&TrackedDetection>, d| match best {
        Some(b) if score(b) >= score(d) => Some(b),
        _ => Some(d),
    })
}

fn nearest_to_midpoint(track: &Track) -> Option<&TrackedDetection> {
    let mid = (track.start_ts() + track.end_ts()) / 2.0;
    track.detections.iter().fold(None, |best: Option<&TrackedDetection>, d| {
        let dist = (d.detection.timestamp - mid).abs();
        match best {
            Some(b) => {
                let bd = (b.detection.timestamp - mid).abs();
                if dist < bd || (dist == bd && d.detection.confidence > b.detection.confidence) {
                    Some(d)
                } else {
                    Some(b)
                }
            }
            None => Some(d),
        }
    })
}

fn top_k_mean(dets: &[TrackedDetection], k: usize, score: fn(&TrackedDetection) -> f32) -> Option<Vec<f32>> {
    let mut ranked: Vec<&TrackedDetection> = dets.iter().collect();
    ranked.sort_by(|a, b| score(b).total_cmp(&score(a)));
    ranked.truncate(k);
    let dim = ranked.first()?.embedding.len();
    let mut mean = vec![0f32; dim];
    for d in ranked.iter().filter(|d| d.embedding.len() == dim) {
        for (m, v) in mean.iter_mut().zip(&d.embedding) {
            *m += v;
        }
    }
    l2_normalize(mean)
}

/// Reduce a closed track to its searchable entry, or `None` when the track
/// is too short to be trusted.
pub fn consolidate(track: &Track, config: &ConsolidatorConfig) -> Option<IndexedFace> {
    if track.len() < config.min_detections.max(1) {
        return None;
    }
    let (rep, embedding) = match config.policy {
        RepresentativePolicy::BestFrame => {
            let best = best_by(&track.detections, confidence)?;
            (best, best.embedding.clone())
        }
        RepresentativePolicy::BestQuality => {
            let best = best_by(&track.detections, quality)?;
            (best, best.embedding.clone())
        }
        RepresentativePolicy::TemporalMidpoint => {
            let mid = nearest_to_midpoint(track)?;
            (mid, mid.embedding.clone())
        }
        RepresentativePolicy::TopKMean(k) => mean_of_best(&track.detections, k, confidence)?,
        RepresentativePolicy::TopQualityMean(k) => mean_of_best(&track.detections, k, quality)?,
    };
    Some(IndexedFace {
        media_id: track.media_id.clone(),
        track_id: track.id,
        embedding,
        timestamp: rep.detection.timestamp,
        start_ts: track.start_ts(),
        end_ts: track.end_ts(),
        detection_count: track.len() as u32,
        confidence: rep.detection.confidence,
        bbox: rep.detection.bbox,
    })
}

fn mean_of_best(
    dets: &[TrackedDetection],
    k: usize,
    score: fn(&TrackedDetection) -> f32,
) -> Option<(&TrackedDetection, Vec<f32>)> {
    let best = best_by(dets, score)?;
    // opposing embeddings can cancel out; fall back to the best frame
    let mean = top_k_mean(dets, k, score).unwrap_or_else(|| best.embedding.clone());
    Some((best, mean))
}

pub fn consolidate_all(tracks: &[Track], config: &ConsolidatorConfig) -> Vec<IndexedFace> {
    tracks.iter().filter_map(|t| consolidate(t, config)).collect()
}
