//! ONNX backends: SCRFD for detection, ArcFace for embeddings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::models::face::{BoundingBox, FaceBox};
use crate::pipeline::detector::{non_max_suppression, FaceDetector};
use crate::pipeline::embedder::FaceEmbedder;

const SCRFD_FILE: &str = "scrfd_500m_bnkps.onnx";
const ARCFACE_FILE: &str = "w600k_r50.onnx";

// Hugging Face mirror first, upstream release as fallback
const SCRFD_MODEL_URL_HF: &str =
    "https://huggingface.co/ykk648/face_lib/resolve/main/face_detect/scrfd_onnx/scrfd_500m_bnkps.onnx";
const SCRFD_MODEL_URL_GH: &str =
    "https://github.com/deepinsight/insightface/releases/download/v0.7/scrfd_500m_bnkps.onnx";
const ARCFACE_MODEL_URL: &str =
    "https://huggingface.co/maze/faceX/resolve/e010b5098c3685fd00b22dd2aec6f37320e3d850/w600k_r50.onnx";

const SCRFD_INPUT: u32 = 640;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_NMS_IOU: f32 = 0.4;
/// Raw scores below this never reach NMS; the configured minimum confidence
/// is applied later by `detect_faces`.
const SCRFD_SCORE_FLOOR: f32 = 0.3;
const MIN_FACE_PX: f32 = 8.0;
const ARCFACE_INPUT: u32 = 112;

#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub models_dir: PathBuf,
    pub auto_download: bool,
    pub use_gpu: bool,
}

/// Make sure both models are on disk (downloading them if allowed) and load
/// them into sessions.
pub async fn load_models(opts: &ModelOptions) -> Result<(ScrfdDetector, ArcFaceEmbedder)> {
    std::fs::create_dir_all(&opts.models_dir).context("Failed to create models directory")?;
    let scrfd_path = opts.models_dir.join(SCRFD_FILE);
    let arcface_path = opts.models_dir.join(ARCFACE_FILE);

    if opts.auto_download {
        let client = http_client()?;
        if !scrfd_path.exists() {
            info!("Downloading SCRFD face detection model...");
            if let Err(e) = download_file(&client, SCRFD_MODEL_URL_HF, &scrfd_path).await {
                warn!("Failed to download from Hugging Face: {}. Trying GitHub...", e);
                download_file(&client, SCRFD_MODEL_URL_GH, &scrfd_path).await?;
            }
        }
        if !arcface_path.exists() {
            info!("Downloading ArcFace recognition model...");
            download_file(&client, ARCFACE_MODEL_URL, &arcface_path).await?;
        }
    }

    if !scrfd_path.exists() || !arcface_path.exists() {
        anyhow::bail!("Face models missing; expected {:?} and {:?}", scrfd_path, arcface_path);
    }
    if opts.use_gpu {
        warn!("GPU execution provider not configured for this build; using CPU");
    }

    let scrfd = Session::builder()?
        .commit_from_file(&scrfd_path)
        .context("Failed to create SCRFD session")?;
    let arcface = Session::builder()?
        .commit_from_file(&arcface_path)
        .context("Failed to create ArcFace session")?;
    info!("Face models loaded from {:?}", opts.models_dir);
    Ok((ScrfdDetector { session: Mutex::new(scrfd) }, ArcFaceEmbedder { session: Mutex::new(arcface) }))
}

fn http_client() -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if !token.is_empty() {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("Failed to create HTTP client")
}

async fn download_file(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download model from {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("Failed to download model: HTTP {}", response.status());
    }
    let bytes = response.bytes().await.context("Failed to read response body")?;
    if bytes.len() < 1024 {
        anyhow::bail!("Downloaded file is suspiciously small ({} bytes)", bytes.len());
    }
    // write under a temporary name so a partial download is never loaded
    let partial = path.with_extension("onnx.part");
    tokio::fs::write(&partial, &bytes)
        .await
        .with_context(|| format!("Failed to write {:?}", partial))?;
    tokio::fs::rename(&partial, path).await?;
    info!("Downloaded model to {:?} ({} bytes)", path, bytes.len());
    Ok(())
}

/// Letterbox `image` into the SCRFD input square: NCHW, BGR, `(v - 127.5) / 128`.
fn preprocess_scrfd(image: &DynamicImage) -> (Vec<f32>, f32) {
    let side = SCRFD_INPUT;
    let scale = side as f32 / image.width().max(image.height()) as f32;
    let nw = ((image.width() as f32 * scale) as u32).max(1);
    let nh = ((image.height() as f32 * scale) as u32).max(1);
    let resized = image.resize_exact(nw, nh, image::imageops::FilterType::Triangle);
    let mut padded = DynamicImage::new_rgb8(side, side);
    image::imageops::overlay(&mut padded, &resized, 0, 0);
    let rgb = padded.to_rgb8();
    let plane = (side * side) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, p) in rgb.pixels().enumerate() {
        data[i] = (p[2] as f32 - 127.5) / 128.0;
        data[plane + i] = (p[1] as f32 - 127.5) / 128.0;
        data[2 * plane + i] = (p[0] as f32 - 127.5) / 128.0;
    }
    (data, scale)
}

fn preprocess_arcface(face_crop: &DynamicImage) -> Vec<f32> {
    let side = ARCFACE_INPUT;
    let rgb = face_crop.resize_exact(side, side, image::imageops::FilterType::Triangle).to_rgb8();
    let plane = (side * side) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, p) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (p[c] as f32 - 127.5) / 128.0;
        }
    }
    data
}

/// Decode one stride level: anchor centres on a `640 / stride` grid, box
/// distances `(l, t, r, b)` in stride units, mapped back to image pixels.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    scale: f32,
    img_w: f32,
    img_h: f32,
    out: &mut Vec<FaceBox>,
) {
    let grid = (SCRFD_INPUT / stride) as usize;
    let points = grid * grid;
    if points == 0 || scores.len() % points != 0 || boxes.len() < scores.len() * 4 {
        warn!("SCRFD stride {}: unexpected output sizes ({} scores, {} box values)", stride, scores.len(), boxes.len());
        return;
    }
    let anchors = scores.len() / points;
    let s = stride as f32;
    for i in 0..points {
        let cx = (i % grid) as f32 * s;
        let cy = (i / grid) as f32 * s;
        for a in 0..anchors {
            let idx = i * anchors + a;
            let conf = scores[idx];
            if conf < SCRFD_SCORE_FLOOR {
                continue;
            }
            let b = &boxes[idx * 4..idx * 4 + 4];
            let x1 = ((cx - b[0] * s) / scale).clamp(0.0, img_w);
            let y1 = ((cy - b[1] * s) / scale).clamp(0.0, img_h);
            let x2 = ((cx + b[2] * s) / scale).clamp(0.0, img_w);
            let y2 = ((cy + b[3] * s) / scale).clamp(0.0, img_h);
            if x2 - x1 < MIN_FACE_PX || y2 - y1 < MIN_FACE_PX {
                continue;
            }
            out.push(FaceBox { bbox: BoundingBox::from_corners(x1, y1, x2, y2), confidence: conf });
        }
    }
}

/// Pick the score and box output names for each stride. Exported models
/// either name them `score_8`/`bbox_8`... or list them positionally as
/// three score tensors followed by three box tensors.
fn stride_outputs(names: &[String]) -> Option<Vec<(u32, String, String)>> {
    let named: Vec<(u32, String, String)> = SCRFD_STRIDES
        .iter()
        .filter_map(|&s| {
            let score = format!("score_{}", s);
            let bbox = format!("bbox_{}", s);
            (names.contains(&score) && names.contains(&bbox)).then_some((s, score, bbox))
        })
        .collect();
    if named.len() == SCRFD_STRIDES.len() {
        return Some(named);
    }
    if names.len() >= 6 {
        return Some(
            SCRFD_STRIDES
                .iter()
                .enumerate()
                .map(|(i, &s)| (s, names[i].clone(), names[i + 3].clone()))
                .collect(),
        );
    }
    None
}

pub struct ScrfdDetector {
    session: Mutex<Session>,
}

impl FaceDetector for ScrfdDetector {
    fn name(&self) -> &str {
        "scrfd"
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let (data, scale) = preprocess_scrfd(image);
        let side = SCRFD_INPUT as i64;
        let input = Value::from_array((vec![1i64, 3, side, side], data)).context("Failed to create SCRFD input tensor")?;

        let mut session = self.session.lock();
        let input_name = session.inputs[0].name.clone();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let layout = stride_outputs(&output_names)
            .with_context(|| format!("unrecognised SCRFD outputs {:?}", output_names))?;
        let outputs = session.run(ort::inputs![input_name => input]).context("SCRFD inference failed")?;

        let (img_w, img_h) = (image.width() as f32, image.height() as f32);
        let mut raw = Vec::new();
        for (stride, score_name, bbox_name) in &layout {
            let (Some(sv), Some(bv)) = (outputs.get(score_name.as_str()), outputs.get(bbox_name.as_str())) else {
                continue;
            };
            let (_, scores) = sv.try_extract_tensor::<f32>()?;
            let (_, boxes) = bv.try_extract_tensor::<f32>()?;
            decode_stride(scores, boxes, *stride, scale, img_w, img_h, &mut raw);
        }
        let keep = non_max_suppression(&raw, SCRFD_NMS_IOU);
        debug!("SCRFD: {} candidates, {} after NMS", raw.len(), keep.len());
        Ok(keep.into_iter().map(|i| raw[i]).collect())
    }
}

pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn name(&self) -> &str {
        "arcface"
    }

    fn embed(&self, face_crop: &DynamicImage) -> Result<Vec<f32>> {
        let side = ARCFACE_INPUT as i64;
        let input = Value::from_array((vec![1i64, 3, side, side], preprocess_arcface(face_crop)))
            .context("Failed to create ArcFace input tensor")?;
        let mut session = self.session.lock();
        let input_name = session.inputs[0].name.clone();
        let output_name = session.outputs.first().map(|o| o.name.clone()).context("ArcFace model has no outputs")?;
        let outputs = session.run(ort::inputs![input_name => input]).context("ArcFace inference failed")?;
        let value = outputs.get(output_name.as_str()).context("ArcFace output missing")?;
        let (_, slice) = value.try_extract_tensor::<f32>()?;
        Ok(slice.to_vec())
    }
}
