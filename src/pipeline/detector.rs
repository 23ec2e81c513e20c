use image::DynamicImage;

use crate::error::FacetError;
use crate::models::face::FaceBox;

/// Locates faces in a single image. No state is carried between calls.
pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceBox>>;
}

/// Run `detector` and keep boxes with at least `min_confidence`, highest
/// confidence first. An image without faces yields an empty list; only
/// malformed input or a backend failure is an error.
pub fn detect_faces(
    detector: &dyn FaceDetector,
    image: &DynamicImage,
    min_confidence: f32,
) -> Result<Vec<FaceBox>, FacetError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(FacetError::ModelInference("empty image".to_string()));
    }
    let mut faces: Vec<FaceBox> = detector
        .detect(image)
        .map_err(|e| FacetError::ModelInference(format!("{} failed: {:#}", detector.name(), e)))?
        .into_iter()
        .filter(|f| f.confidence.is_finite() && f.confidence >= min_confidence && f.bbox.area() > 0.0)
        .collect();
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(faces)
}

/// The query face when an image holds several: the most confident detection.
pub fn primary_face(faces: &[FaceBox]) -> Option<FaceBox> {
    faces.iter().copied().max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Greedy non-maximum suppression; returns the kept indices, most confident
/// first.
pub fn non_max_suppression(boxes: &[FaceBox], iou_threshold: f32) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..boxes.len()).collect();
    indices.sort_by(|&a, &b| boxes[b].confidence.total_cmp(&boxes[a].confidence));
    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for (i, &ia) in indices.iter().enumerate() {
        if suppressed[ia] {
            continue;
        }
        keep.push(ia);
        for &ib in indices.iter().skip(i + 1) {
            if !suppressed[ib] && boxes[ia].bbox.iou(&boxes[ib].bbox) > iou_threshold {
                suppressed[ib] = true;
            }
        }
    }
    keep
}
