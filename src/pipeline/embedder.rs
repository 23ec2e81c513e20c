use image::DynamicImage;

use crate::error::FacetError;
use crate::models::face::BoundingBox;

/// Maps a face crop to an embedding. Implementations need not normalize;
/// [`embed_face`] does that for every backend.
pub trait FaceEmbedder: Send + Sync {
    fn name(&self) -> &str;
    fn embed(&self, face_crop: &DynamicImage) -> anyhow::Result<Vec<f32>>;
}

/// Side of the face crop the size term is measured against.
const QUALITY_BASE_SIDE: f32 = 112.0;

/// Crop `bbox` (grown by `margin` on each side) out of `image`, embed it and
/// scale the result to unit length.
pub fn embed_face(
    embedder: &dyn FaceEmbedder,
    image: &DynamicImage,
    bbox: &BoundingBox,
    margin: f32,
) -> Result<Vec<f32>, FacetError> {
    let crop = face_crop(image, bbox, margin)?;
    embed_crop(embedder, &crop)
}

pub fn face_crop(image: &DynamicImage, bbox: &BoundingBox, margin: f32) -> Result<DynamicImage, FacetError> {
    let (x, y, w, h) = bbox
        .expanded_crop(margin, image.width(), image.height())
        .ok_or_else(|| FacetError::ModelInference(format!("face box {:?} lies outside the image", bbox)))?;
    Ok(image.crop_imm(x, y, w, h))
}

pub fn embed_crop(embedder: &dyn FaceEmbedder, crop: &DynamicImage) -> Result<Vec<f32>, FacetError> {
    let raw = embedder
        .embed(crop)
        .map_err(|e| FacetError::ModelInference(format!("{} failed: {:#}", embedder.name(), e)))?;
    l2_normalize(raw).ok_or_else(|| FacetError::ModelInference(format!("{} produced a degenerate embedding", embedder.name())))
}

/// How usable a face crop is: sharpness (variance of the Laplacian over its
/// luma) plus a size term relative to a 112px face. Only comparable between
/// crops of the same video.
pub fn face_quality(crop: &DynamicImage) -> f32 {
    let size = (crop.width() * crop.height()) as f32 / (QUALITY_BASE_SIDE * QUALITY_BASE_SIDE);
    0.4 * laplacian_variance(crop) + 0.1 * size
}

fn laplacian_variance(crop: &DynamicImage) -> f32 {
    let luma = crop.to_luma8();
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| luma.get_pixel(x, y)[0] as f64;
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let n = ((w - 2) * (h - 2)) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

/// Unit-length copy of `v`, or `None` for an empty, zero or non-finite vector.
pub fn l2_normalize(mut v: Vec<f32>) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if v.is_empty() || !norm.is_finite() || norm <= f32::EPSILON {
        return None;
    }
    for x in &mut v {
        *x /= norm;
    }
    Some(v)
}

/// Euclidean distance, the one metric used for both tracking and search.
/// On unit vectors it lies in `[0, 2]`; mismatched dimensions count as the
/// maximum distance.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
