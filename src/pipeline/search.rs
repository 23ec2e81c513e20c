use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::db::{self, DbPool};
use crate::error::FacetError;
use crate::models::face::SearchResult;
use crate::pipeline::detector::{detect_faces, primary_face, FaceDetector};
use crate::pipeline::embedder::{embed_face, FaceEmbedder};
use crate::pipeline::index::{FaceIndex, IndexStore};
use crate::stats::Stats;

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub min_detection_confidence: f32,
    pub crop_margin: f32,
    /// Largest Euclidean distance (unit embeddings) still reported as a match.
    pub acceptance_threshold: f32,
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_detection_confidence: 0.5,
            crop_margin: 0.2,
            acceptance_threshold: 0.84,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Heuristic confidence for a distance between unit vectors: a linear map of
/// `[0, 2]` onto `[1, 0]`. Not a calibrated probability.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Match policy: accept the nearest face only within `threshold`.
pub fn decide(index: &FaceIndex, query: &[f32], threshold: f32) -> SearchResult {
    match index.nearest(query, 1).first() {
        Some(best) if best.distance <= threshold => {
            SearchResult::matched(best.face, best.distance, confidence_from_distance(best.distance))
        }
        Some(best) => SearchResult::no_match(Some(best.distance)),
        None => SearchResult::no_match(None),
    }
}

/// Decode a query image and embed its primary face, the most confident
/// detection when several are present.
pub fn embed_query(
    detector: &dyn FaceDetector,
    embedder: &dyn FaceEmbedder,
    image_bytes: &[u8],
    config: &SearchConfig,
) -> Result<Vec<f32>, FacetError> {
    let image = image::load_from_memory(image_bytes)
        .map_err(|e| FacetError::ModelInference(format!("query image could not be decoded: {}", e)))?;
    let faces = detect_faces(detector, &image, config.min_detection_confidence)?;
    let primary = primary_face(&faces).ok_or(FacetError::NoFaceDetected)?;
    if faces.len() > 1 {
        debug!("query has {} faces, using the most confident ({:.2})", faces.len(), primary.confidence);
    }
    embed_face(embedder, &image, &primary.bbox, config.crop_margin)
}

pub struct SearchEngine {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    pool: DbPool,
    index: Arc<IndexStore>,
    stats: Arc<Stats>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        pool: DbPool,
        index: Arc<IndexStore>,
        stats: Arc<Stats>,
        config: SearchConfig,
    ) -> Self {
        Self { detector, embedder, pool, index, stats, config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Find where the face in `image_bytes` appears in `media_id`.
    ///
    /// `NotReady`, `NoFaceDetected` and `NotFound` are distinct errors so
    /// the caller can tell them apart from a plain no-match result.
    pub async fn search(&self, media_id: &str, image_bytes: Vec<u8>) -> Result<SearchResult, FacetError> {
        self.stats.inc_searches();
        let result = match tokio::time::timeout(self.config.timeout, self.search_inner(media_id, image_bytes)).await {
            Ok(r) => r,
            Err(_) => Err(FacetError::Timeout(self.config.timeout)),
        };
        match &result {
            Ok(r) if r.found => self.stats.inc_search_matches(),
            Err(FacetError::NoFaceDetected) => self.stats.inc_search_no_face(),
            Err(FacetError::NotReady { .. }) => self.stats.inc_search_not_ready(),
            _ => {}
        }
        result
    }

    async fn search_inner(&self, media_id: &str, image_bytes: Vec<u8>) -> Result<SearchResult, FacetError> {
        let index = self.ready_index(media_id).await?;

        let detector = self.detector.clone();
        let embedder = self.embedder.clone();
        let config = self.config.clone();
        let query = tokio::task::spawn_blocking(move || {
            embed_query(detector.as_ref(), embedder.as_ref(), &image_bytes, &config)
        })
        .await??;

        let result = decide(&index, &query, self.config.acceptance_threshold);
        debug!(
            media_id = %media_id,
            found = result.found,
            distance = ?result.distance,
            "search over {} faces",
            index.len()
        );
        Ok(result)
    }

    /// The published index of a `ready` media, loaded from the database when
    /// this process has not seen it yet.
    async fn ready_index(&self, media_id: &str) -> Result<Arc<FaceIndex>, FacetError> {
        let pool = self.pool.clone();
        let store = self.index.clone();
        let id = media_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Arc<FaceIndex>, FacetError> {
            let conn = pool.get().map_err(anyhow::Error::from)?;
            let status = db::query::get_media_status(&conn, &id)?.ok_or_else(|| FacetError::NotFound(id.clone()))?;
            if !status.is_ready() {
                return Err(FacetError::NotReady { status });
            }
            let index = store.get_or_load(&id, || {
                let faces = db::query::load_media_faces(&conn, &id)?;
                FaceIndex::from_faces(id.as_str(), faces)
            })?;
            Ok(index)
        })
        .await?
    }
}
