use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::pipeline::consolidate::{ConsolidatorConfig, RepresentativePolicy};
use crate::pipeline::ingest::PipelineConfig;
use crate::pipeline::sampler::SamplerConfig;
use crate::pipeline::search::SearchConfig;
use crate::pipeline::tracker::TrackerConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub data: PathBuf,
    pub port: u16,
    pub db_pool_size: u32,
    pub max_upload_mb: u64,
    pub ingest_workers: usize,
    pub ingest_timeout_secs: u64,
    pub ingest_cancel_grace_secs: u64,
    pub search_timeout_secs: u64,
    pub sample_fps: f32,
    pub max_frame_side: u32,
    pub frame_batch: usize,
    pub min_detection_confidence: f32,
    pub crop_margin: f32,
    pub track_max_gap_frames: u32,
    pub track_max_embedding_distance: f32,
    pub track_spatial_weight: f32,
    pub track_max_cost: f32,
    pub min_track_detections: usize,
    pub representative: RepresentativePolicy,
    pub acceptance_threshold: f32,
    pub face_auto_download: bool,
    pub face_use_gpu: bool,
}

fn var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let data = env::var("FACET_DATA").unwrap_or_else(|_| "./data".to_string());
        let representative = match env::var("FACET_REPRESENTATIVE") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                warn!("FACET_REPRESENTATIVE: {}; using best-frame", e);
                RepresentativePolicy::BestFrame
            }),
            Err(_) => RepresentativePolicy::BestFrame,
        };
        Self {
            data: PathBuf::from(data),
            port: var("FACET_PORT", 8000),
            db_pool_size: var("FACET_DB_POOL_SIZE", 8),
            max_upload_mb: var("FACET_MAX_UPLOAD_MB", 2048),
            ingest_workers: var("FACET_INGEST_WORKERS", 2),
            ingest_timeout_secs: var("FACET_INGEST_TIMEOUT_SECS", 1800),
            ingest_cancel_grace_secs: var("FACET_INGEST_CANCEL_GRACE_SECS", 10),
            search_timeout_secs: var("FACET_SEARCH_TIMEOUT_SECS", 30),
            sample_fps: var("FACET_SAMPLE_FPS", 3.0),
            max_frame_side: var("FACET_MAX_FRAME_SIDE", 960),
            frame_batch: var("FACET_FRAME_BATCH", 8),
            min_detection_confidence: var("FACET_MIN_DETECTION_CONFIDENCE", 0.5),
            crop_margin: var("FACET_CROP_MARGIN", 0.2),
            track_max_gap_frames: var("FACET_TRACK_MAX_GAP_FRAMES", 5),
            track_max_embedding_distance: var("FACET_TRACK_MAX_EMBEDDING_DISTANCE", 1.0),
            track_spatial_weight: var("FACET_TRACK_SPATIAL_WEIGHT", 0.5),
            track_max_cost: var("FACET_TRACK_MAX_COST", 1.25),
            min_track_detections: var("FACET_MIN_TRACK_DETECTIONS", 3),
            representative,
            acceptance_threshold: var("FACET_ACCEPTANCE_THRESHOLD", 0.84),
            face_auto_download: flag("FACET_FACE_AUTO_DOWNLOAD", true),
            face_use_gpu: flag("FACET_FACE_USE_GPU", false),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data.join("db").join("facet.db")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data.join("uploads")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data.join("models")
    }

    pub fn pipeline(&self) -> PipelineConfig {
        let sampler = SamplerConfig { fps: self.sample_fps, max_side: self.max_frame_side, ..SamplerConfig::default() };
        let tracker = TrackerConfig {
            max_embedding_distance: self.track_max_embedding_distance,
            spatial_weight: self.track_spatial_weight,
            max_cost: self.track_max_cost,
            ..TrackerConfig::default()
        }
        .with_gap_frames(self.track_max_gap_frames, self.sample_fps);
        PipelineConfig {
            sampler,
            min_detection_confidence: self.min_detection_confidence,
            crop_margin: self.crop_margin,
            tracker,
            consolidator: ConsolidatorConfig { min_detections: self.min_track_detections, policy: self.representative },
            frame_batch: self.frame_batch,
            timeout: Duration::from_secs(self.ingest_timeout_secs),
            cancel_grace: Duration::from_secs(self.ingest_cancel_grace_secs),
        }
    }

    pub fn search(&self) -> SearchConfig {
        SearchConfig {
            min_detection_confidence: self.min_detection_confidence,
            crop_margin: self.crop_margin,
            acceptance_threshold: self.acceptance_threshold,
            timeout: Duration::from_secs(self.search_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "FACET_DATA",
        "FACET_PORT",
        "FACET_SAMPLE_FPS",
        "FACET_TRACK_MAX_GAP_FRAMES",
        "FACET_REPRESENTATIVE",
        "FACET_ACCEPTANCE_THRESHOLD",
        "FACET_INGEST_TIMEOUT_SECS",
        "FACET_INGEST_CANCEL_GRACE_SECS",
        "FACET_FACE_AUTO_DOWNLOAD",
    ];

    fn clear_vars(vars: &[&str]) -> Vec<(String, Option<String>)> {
        let mut saved = Vec::new();
        for &k in vars {
            let prev = env::var(k).ok();
            saved.push((k.to_string(), prev));
            env::remove_var(k);
        }
        saved
    }

    fn restore_vars(saved: Vec<(String, Option<String>)>) {
        for (k, v) in saved {
            if let Some(val) = v {
                env::set_var(k, val);
            } else {
                env::remove_var(k);
            }
        }
    }

    // env is process-global; keep every env-mutating assertion in one test
    #[test]
    fn test_config_defaults_and_overrides() {
        let saved = clear_vars(VARS);

        let config = Config::from_env();
        assert_eq!(config.data, PathBuf::from("./data"));
        assert_eq!(config.port, 8000);
        assert_eq!(config.sample_fps, 3.0);
        assert_eq!(config.representative, RepresentativePolicy::BestFrame);
        assert_eq!(config.acceptance_threshold, 0.84);
        assert!(config.face_auto_download);
        assert_eq!(config.db_path(), PathBuf::from("./data/db/facet.db"));

        env::set_var("FACET_DATA", "/srv/facet");
        env::set_var("FACET_PORT", "9090");
        env::set_var("FACET_SAMPLE_FPS", "5");
        env::set_var("FACET_TRACK_MAX_GAP_FRAMES", "9");
        env::set_var("FACET_REPRESENTATIVE", "top:4");
        env::set_var("FACET_ACCEPTANCE_THRESHOLD", "0.7");
        env::set_var("FACET_INGEST_TIMEOUT_SECS", "60");
        env::set_var("FACET_INGEST_CANCEL_GRACE_SECS", "3");
        env::set_var("FACET_FACE_AUTO_DOWNLOAD", "false");
        let config = Config::from_env();
        assert_eq!(config.port, 9090);
        assert_eq!(config.uploads_dir(), PathBuf::from("/srv/facet/uploads"));
        assert_eq!(config.representative, RepresentativePolicy::TopKMean(4));
        assert!(!config.face_auto_download);

        let pipeline = config.pipeline();
        assert_eq!(pipeline.sampler.fps, 5.0);
        assert!((pipeline.tracker.max_gap_secs - 2.0).abs() < 1e-9);
        assert_eq!(pipeline.timeout, Duration::from_secs(60));
        assert_eq!(pipeline.cancel_grace, Duration::from_secs(3));
        assert_eq!(config.search().acceptance_threshold, 0.7);

        // malformed values fall back to defaults
        env::set_var("FACET_PORT", "not-a-port");
        env::set_var("FACET_REPRESENTATIVE", "median");
        let config = Config::from_env();
        assert_eq!(config.port, 8000);
        assert_eq!(config.representative, RepresentativePolicy::BestFrame);

        restore_vars(saved);
    }
}
