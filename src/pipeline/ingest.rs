//! Background ingestion: video -> frames -> faces -> tracks -> index.
//!
//! A run owns all of its state. The only shared things it touches are the
//! database row of its media, and the [`IndexStore`] slot it publishes into
//! once the whole index is built.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::db::{self, DbPool};
use crate::error::FacetError;
use crate::models::face::IndexedFace;
use crate::models::media::MediaStatus;
use crate::pipeline::consolidate::{consolidate_all, ConsolidatorConfig};
use crate::pipeline::detector::{detect_faces, FaceDetector};
use crate::pipeline::embedder::{embed_crop, face_crop, face_quality, FaceEmbedder};
use crate::pipeline::index::{FaceIndex, IndexStore};
use crate::pipeline::sampler::{DecoderStop, Frame, FrameDecoder, SampledVideo, SamplerConfig};
use crate::pipeline::tracker::{FaceTracker, TrackedDetection, TrackerConfig};
use crate::stats::Stats;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sampler: SamplerConfig,
    pub min_detection_confidence: f32,
    /// Fraction of the box size added on each side before embedding.
    pub crop_margin: f32,
    pub tracker: TrackerConfig,
    pub consolidator: ConsolidatorConfig,
    /// Frames analysed in parallel before they are fed to the tracker.
    pub frame_batch: usize,
    pub timeout: Duration,
    /// How long a timed-out run is given to unwind after its decoder is
    /// stopped. Past it the run is abandoned and the media failed anyway.
    pub cancel_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let sampler = SamplerConfig::default();
        let tracker = TrackerConfig::default().with_gap_frames(5, sampler.fps);
        Self {
            sampler,
            min_detection_confidence: 0.5,
            crop_margin: 0.2,
            tracker,
            consolidator: ConsolidatorConfig::default(),
            frame_batch: 8,
            timeout: Duration::from_secs(30 * 60),
            cancel_grace: Duration::from_secs(10),
        }
    }
}

/// Model and decoder backends shared by ingestion and search.
#[derive(Clone)]
pub struct Backends {
    pub decoder: Arc<dyn FrameDecoder>,
    pub detector: Arc<dyn FaceDetector>,
    pub embedder: Arc<dyn FaceEmbedder>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub frames_sampled: u64,
    pub frames_failed: u64,
    pub detections: u64,
    pub tracks: usize,
    pub faces_indexed: usize,
    pub duration_secs: Option<f64>,
}

struct IngestOutput {
    faces: Vec<IndexedFace>,
    report: IngestReport,
}

/// Removes the media id from the in-flight set when the run ends, however
/// it ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    media_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.media_id);
    }
}

pub struct IngestionPipeline {
    backends: Backends,
    pool: DbPool,
    index: Arc<IndexStore>,
    stats: Arc<Stats>,
    config: PipelineConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl IngestionPipeline {
    pub fn new(
        backends: Backends,
        pool: DbPool,
        index: Arc<IndexStore>,
        stats: Arc<Stats>,
        config: PipelineConfig,
    ) -> Self {
        Self { backends, pool, index, stats, config, in_flight: Mutex::new(HashSet::new()) }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_in_flight(&self, media_id: &str) -> bool {
        self.in_flight.lock().contains(media_id)
    }

    fn claim(&self, media_id: &str) -> Result<InFlightGuard<'_>, FacetError> {
        let mut set = self.in_flight.lock();
        if !set.insert(media_id.to_string()) {
            return Err(FacetError::AlreadyProcessing(media_id.to_string()));
        }
        Ok(InFlightGuard { set: &self.in_flight, media_id: media_id.to_string() })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, FacetError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let out = tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let conn = pool.get()?;
            f(&conn)
        })
        .await??;
        Ok(out)
    }

    /// Ingest `source` as the (re)built index of `media_id`.
    ///
    /// On success the media is `ready` with the new index published. On any
    /// failure, timeout included, the media ends `failed` with the reason
    /// recorded, and the error is also returned to the caller.
    pub async fn run(&self, media_id: &str, source: &Path) -> Result<IngestReport, FacetError> {
        let _guard = self.claim(media_id)?;
        let started = Instant::now();

        let id = media_id.to_string();
        self.with_conn(move |conn| db::writer::transition_status(conn, &id, MediaStatus::Processing, None))
            .await?;
        info!(media_id = %media_id, "ingestion started");

        let result = self.process_with_timeout(media_id, source).await;
        let result = match result {
            Ok(output) => self.publish(media_id, output).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(report) => {
                self.stats.record_ingest(report.frames_sampled, report.frames_failed, report.faces_indexed as u64);
                info!(
                    media_id = %media_id,
                    faces = report.faces_indexed,
                    tracks = report.tracks,
                    frames = report.frames_sampled,
                    skipped = report.frames_failed,
                    "ingestion finished in {:?}",
                    started.elapsed()
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.inc_ingest_failed();
                if matches!(e, FacetError::Timeout(_)) {
                    self.stats.inc_ingest_timeouts();
                }
                warn!(media_id = %media_id, "ingestion failed: {}", e);
                let id = media_id.to_string();
                let reason = e.to_string();
                if let Err(mark_err) = self.with_conn(move |conn| db::writer::mark_failed(conn, &id, &reason)).await {
                    error!(media_id = %media_id, "could not record failure: {}", mark_err);
                }
                Err(e)
            }
        }
    }

    async fn process_with_timeout(&self, media_id: &str, source: &Path) -> Result<IngestOutput, FacetError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Mutex::new(None));
        let work = Work {
            backends: self.backends.clone(),
            config: self.config.clone(),
            media_id: media_id.to_string(),
            source: source.to_path_buf(),
            cancel: cancel.clone(),
            stop: stop.clone(),
        };
        let mut handle = tokio::task::spawn_blocking(move || work.process());
        match tokio::time::timeout(self.config.timeout, &mut handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                let decoder: Option<DecoderStop> = stop.lock().take();
                if let Some(decoder) = decoder {
                    decoder.stop();
                }
                match tokio::time::timeout(self.config.cancel_grace, &mut handle).await {
                    Ok(_) => debug!(media_id = %media_id, "timed-out ingestion unwound"),
                    // dropping the handle detaches the task; it frees the
                    // decoder and models whenever the stalled call returns
                    Err(_) => warn!(
                        media_id = %media_id,
                        "ingestion still busy {:?} after cancellation, abandoning it",
                        self.config.cancel_grace
                    ),
                }
                Err(FacetError::Timeout(self.config.timeout))
            }
        }
    }

    /// Swap the new index in, then commit it with the `ready` status. Search
    /// checks the status first, so until the commit lands it answers "not
    /// ready" and never pairs `ready` with the previous index.
    async fn publish(&self, media_id: &str, output: IngestOutput) -> Result<IngestReport, FacetError> {
        let IngestOutput { faces, report } = output;
        let index = FaceIndex::from_faces(media_id, faces.clone())?;
        let previous = self.index.publish(index);

        let id = media_id.to_string();
        let duration = report.duration_secs;
        let committed = self
            .with_conn(move |conn| db::writer::publish_media_index(conn, &id, &faces, duration))
            .await;
        if let Err(e) = committed {
            self.index.restore(media_id, previous);
            return Err(e);
        }
        Ok(report)
    }
}

/// Everything one blocking ingestion run needs, owned.
struct Work {
    backends: Backends,
    config: PipelineConfig,
    media_id: String,
    source: PathBuf,
    cancel: Arc<AtomicBool>,
    /// Where the opened decoder's stop handle is parked for the timeout path.
    stop: Arc<Mutex<Option<DecoderStop>>>,
}

impl Work {
    fn process(self) -> Result<IngestOutput, FacetError> {
        let SampledVideo { duration_secs, mut frames, stop } =
            self.backends.decoder.open(&self.source, &self.config.sampler)?;
        *self.stop.lock() = stop;
        let mut tracker = FaceTracker::new(self.media_id.clone(), self.config.tracker.clone());
        let mut report = IngestReport::default();
        let mut last_ts = None;
        let batch_size = self.config.frame_batch.max(1);

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                debug!(media_id = %self.media_id, "ingestion cancelled after {} frames", report.frames_sampled);
                return Err(FacetError::Timeout(self.config.timeout));
            }
            let batch: Vec<Frame> = frames.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            // par_iter keeps input order, so results come back in time order
            let analysed: Vec<(f64, Result<Vec<TrackedDetection>, FacetError>)> =
                batch.par_iter().map(|frame| (frame.timestamp, self.analyse_frame(frame))).collect();
            for (timestamp, result) in analysed {
                report.frames_sampled += 1;
                last_ts = Some(timestamp);
                match result {
                    Ok(dets) => {
                        report.detections += dets.len() as u64;
                        tracker.update(timestamp, dets);
                    }
                    Err(e) => {
                        report.frames_failed += 1;
                        warn!(media_id = %self.media_id, "skipping frame at {:.2}s: {}", timestamp, e);
                    }
                }
            }
        }
        // release the decoder before the expensive tail
        self.stop.lock().take();
        drop(frames);
        if self.cancel.load(Ordering::SeqCst) {
            return Err(FacetError::Timeout(self.config.timeout));
        }

        if report.frames_sampled == 0 {
            return Err(FacetError::Decode("no frames could be extracted".to_string()));
        }
        if report.frames_failed == report.frames_sampled {
            return Err(FacetError::ModelInference(format!(
                "inference failed on all {} sampled frames",
                report.frames_sampled
            )));
        }

        let tracks = tracker.finish();
        let faces = consolidate_all(&tracks, &self.config.consolidator);
        report.tracks = tracks.len();
        report.faces_indexed = faces.len();
        report.duration_secs = duration_secs.or(last_ts);
        Ok(IngestOutput { faces, report })
    }

    fn analyse_frame(&self, frame: &Frame) -> Result<Vec<TrackedDetection>, FacetError> {
        let faces = detect_faces(self.backends.detector.as_ref(), &frame.image, self.config.min_detection_confidence)?;
        let mut out = Vec::with_capacity(faces.len());
        for face in faces {
            let embedded = face_crop(&frame.image, &face.bbox, self.config.crop_margin).and_then(|crop| {
                let quality = face_quality(&crop);
                embed_crop(self.backends.embedder.as_ref(), &crop).map(|embedding| (embedding, quality))
            });
            match embedded {
                Ok((embedding, quality)) => {
                    out.push(TrackedDetection { detection: face.at(frame.timestamp), embedding, quality })
                }
                Err(e) => debug!(media_id = %self.media_id, "dropping face at {:.2}s: {}", frame.timestamp, e),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub media_id: String,
    pub source: PathBuf,
}

pub fn ingest_channel(capacity: usize) -> (Sender<IngestJob>, Receiver<IngestJob>) {
    mpsc::channel(capacity.max(1))
}

/// Spawn `workers` tasks draining the job queue. Each job runs to
/// completion before its worker takes the next one; failures are already
/// recorded on the media by [`IngestionPipeline::run`].
pub fn start_ingest_workers(workers: usize, rx: Receiver<IngestJob>, pipeline: Arc<IngestionPipeline>) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker in 0..workers.max(1) {
        let rx = rx.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else { break };
                debug!(worker, media_id = %job.media_id, "picked up ingest job");
                if let Err(e) = pipeline.run(&job.media_id, &job.source).await {
                    debug!(worker, media_id = %job.media_id, "job ended with {}", e.code());
                }
            }
            debug!(worker, "ingest worker stopped");
        });
    }
}
