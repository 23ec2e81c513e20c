#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use facet_engine::db::{self, DbPool};
use facet_engine::error::FacetError;
use facet_engine::models::face::{BoundingBox, FaceBox};
use facet_engine::models::media::{MediaAsset, MediaStatus};
use facet_engine::pipeline::sampler::{DecoderStop, Frame, SampledVideo};
use facet_engine::pipeline::{
    Backends, FaceDetector, FaceEmbedder, FrameDecoder, PipelineConfig, SamplerConfig, SearchConfig,
};
use facet_engine::{AppPaths, AppSettings, AppState};
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const FACE_SIDE: u32 = 30;

pub const RED: [u8; 3] = [220, 30, 30];
pub const GREEN: [u8; 3] = [30, 200, 40];
pub const BLUE: [u8; 3] = [20, 40, 230];
/// Not a face: [`ColorSquareDetector::failing_on`] uses it to break frames.
pub const MARKER: [u8; 3] = [250, 250, 250];

/// Draw `faces` as solid squares on a black frame. Later squares are drawn
/// over earlier ones.
pub fn frame(faces: &[([u8; 3], u32, u32)]) -> DynamicImage {
    let mut img = RgbImage::new(WIDTH, HEIGHT);
    for &(color, x, y) in faces {
        for py in y..(y + FACE_SIDE).min(HEIGHT) {
            for px in x..(x + FACE_SIDE).min(WIDTH) {
                img.put_pixel(px, py, Rgb(color));
            }
        }
    }
    DynamicImage::ImageRgb8(img)
}

pub fn blank() -> DynamicImage {
    frame(&[])
}

pub fn png_bytes(img: &DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageOutputFormat::Png).unwrap();
    buf.into_inner()
}

pub fn query(color: [u8; 3]) -> Vec<u8> {
    png_bytes(&frame(&[(color, 60, 40)]))
}

fn is_black(p: &Rgb<u8>) -> bool {
    p.0.iter().all(|&c| c < 16)
}

/// Every distinct non-black colour is one face, boxed around its pixels.
/// Faces score 0.9 unless given their own confidence.
#[derive(Default)]
pub struct ColorSquareDetector {
    confidence: HashMap<[u8; 3], f32>,
    failing_on: Option<[u8; 3]>,
}

impl ColorSquareDetector {
    pub fn with_confidence(mut self, color: [u8; 3], confidence: f32) -> Self {
        self.confidence.insert(color, confidence);
        self
    }

    /// Error out on any frame showing `color`.
    pub fn failing_on(mut self, color: [u8; 3]) -> Self {
        self.failing_on = Some(color);
        self
    }
}

impl FaceDetector for ColorSquareDetector {
    fn name(&self) -> &str {
        "color-squares"
    }

    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceBox>> {
        let rgb = image.to_rgb8();
        let mut regions: BTreeMap<[u8; 3], (u32, u32, u32, u32)> = BTreeMap::new();
        for (x, y, p) in rgb.enumerate_pixels() {
            if is_black(p) {
                continue;
            }
            if Some(p.0) == self.failing_on {
                bail!("detector crashed on frame");
            }
            let r = regions.entry(p.0).or_insert((x, y, x, y));
            r.0 = r.0.min(x);
            r.1 = r.1.min(y);
            r.2 = r.2.max(x);
            r.3 = r.3.max(y);
        }
        Ok(regions
            .into_iter()
            .map(|(color, (x1, y1, x2, y2))| FaceBox {
                bbox: BoundingBox::from_corners(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32),
                confidence: self.confidence.get(&color).copied().unwrap_or(0.9),
            })
            .collect())
    }
}

/// Hangs on every call for the wrapped duration, then detects like
/// [`ColorSquareDetector`]. Nothing can interrupt the hang.
pub struct StallingDetector(pub Duration);

impl FaceDetector for StallingDetector {
    fn name(&self) -> &str {
        "stalling"
    }

    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceBox>> {
        std::thread::sleep(self.0);
        ColorSquareDetector::default().detect(image)
    }
}

/// Embeds a crop as its dominant non-black colour.
pub struct DominantColorEmbedder;

impl FaceEmbedder for DominantColorEmbedder {
    fn name(&self) -> &str {
        "dominant-color"
    }

    fn embed(&self, image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        let rgb = image.to_rgb8();
        let mut counts: HashMap<[u8; 3], usize> = HashMap::new();
        for p in rgb.pixels() {
            if !is_black(p) {
                *counts.entry(p.0).or_default() += 1;
            }
        }
        let Some((color, _)) = counts.into_iter().max_by_key(|(c, n)| (*n, *c)) else {
            bail!("crop has no face pixels");
        };
        Ok(color.iter().map(|&c| c as f32 / 255.0).collect())
    }
}

/// Serves frames from registered scenarios. A stored "video" file holds the
/// scenario name as text, so the same decoder works behind uploads. The
/// frame delay is cut short, ending the video, when the decoder is stopped.
#[derive(Default)]
pub struct ScenarioDecoder {
    scenarios: Mutex<HashMap<String, Vec<DynamicImage>>>,
    frame_delay: Mutex<Duration>,
}

impl ScenarioDecoder {
    pub fn add(&self, name: &str, frames: Vec<DynamicImage>) {
        self.scenarios.lock().insert(name.to_string(), frames);
    }

    pub fn set_frame_delay(&self, delay: Duration) {
        *self.frame_delay.lock() = delay;
    }
}

impl FrameDecoder for ScenarioDecoder {
    fn open(&self, source: &Path, config: &SamplerConfig) -> Result<SampledVideo, FacetError> {
        let name = std::fs::read_to_string(source)
            .map_err(|e| FacetError::Decode(format!("{}: {}", source.display(), e)))?;
        let frames = self
            .scenarios
            .lock()
            .get(name.trim())
            .cloned()
            .ok_or_else(|| FacetError::Decode(format!("unsupported container: {}", name.trim())))?;
        let fps = config.fps as f64;
        let delay = *self.frame_delay.lock();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let iter = frames.into_iter().enumerate().map_while(move |(i, image)| {
            if !wait_unless_stopped(delay, &flag) {
                return None;
            }
            Some(Frame { index: i as u64, timestamp: i as f64 / fps, image })
        });
        let stop = DecoderStop::new(move || stopped.store(true, Ordering::SeqCst));
        Ok(SampledVideo { duration_secs: None, frames: Box::new(iter), stop: Some(stop) })
    }
}

/// Sleep for `delay` in small steps; false as soon as `stopped` is set.
fn wait_unless_stopped(delay: Duration, stopped: &AtomicBool) -> bool {
    let until = Instant::now() + delay;
    loop {
        if stopped.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        std::thread::sleep((until - now).min(Duration::from_millis(5)));
    }
}

/// `n` frames of the same face standing still.
pub fn still(color: [u8; 3], n: usize) -> Vec<DynamicImage> {
    (0..n).map(|_| frame(&[(color, 20, 20)])).collect()
}

pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig { frame_batch: 4, timeout: Duration::from_secs(20), ..PipelineConfig::default() }
}

pub fn setup_test_db() -> (TempDir, DbPool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::create_pool(tmp.path().join("facet.db"), 4).unwrap();
    (tmp, pool)
}

pub struct TestEnv {
    pub tmp: TempDir,
    pub state: Arc<AppState>,
    pub decoder: Arc<ScenarioDecoder>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_pipeline_config())
    }

    /// Must be called inside a tokio runtime; starts the ingest workers.
    pub fn with_config(pipeline: PipelineConfig) -> Self {
        Self::with_detector(pipeline, Arc::new(ColorSquareDetector::default()))
    }

    /// Same as [`TestEnv::with_config`], with `detector` serving both
    /// ingestion and search.
    pub fn with_detector(pipeline: PipelineConfig, detector: Arc<dyn FaceDetector>) -> Self {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().to_path_buf();
        let uploads = data.join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let db_path = data.join("facet.db");
        let pool = db::create_pool(&db_path, 4).unwrap();
        let decoder = Arc::new(ScenarioDecoder::default());
        let backends = Backends {
            decoder: decoder.clone(),
            detector,
            embedder: Arc::new(DominantColorEmbedder),
        };
        let settings = AppSettings {
            paths: AppPaths { data, db_path, uploads },
            pipeline,
            search: SearchConfig::default(),
            ingest_workers: 2,
            max_upload_bytes: 16 * 1024 * 1024,
        };
        let state = AppState::start(settings, pool, backends);
        Self { tmp, state, decoder }
    }

    /// Store a video whose content selects `scenario` and register it as a
    /// pending media, without queueing it.
    pub fn add_media(&self, scenario: &str) -> (String, PathBuf) {
        let id = uuid::Uuid::new_v4().to_string();
        let stored = format!("{}.mp4", id);
        let path = self.state.paths.uploads.join(&stored);
        std::fs::write(&path, scenario).unwrap();
        let media = MediaAsset {
            id: id.clone(),
            filename: format!("{}.mp4", scenario),
            stored_filename: stored,
            status: MediaStatus::Pending,
            duration_secs: None,
            face_count: 0,
            failure_reason: None,
            created_at: chrono::Utc::now().timestamp(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        let conn = self.state.pool.get().unwrap();
        db::writer::insert_media(&conn, &media).unwrap();
        (id, path)
    }

    pub fn media(&self, id: &str) -> MediaAsset {
        let conn = self.state.pool.get().unwrap();
        db::query::get_media(&conn, id).unwrap().unwrap()
    }

    pub async fn wait_for_status(&self, id: &str, wanted: MediaStatus) -> MediaAsset {
        for _ in 0..200 {
            let media = self.media(id);
            if media.status == wanted {
                return media;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("media {} never reached {}, last seen {}", id, wanted, self.media(id).status);
    }

    /// Serve the router on an ephemeral port and return its base url.
    pub async fn serve(&self) -> String {
        let app = facet_engine::api::routes::router(self.state.clone());
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{}", port)
    }
}
