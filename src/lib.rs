pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod stats;
pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::Sender;

use crate::db::DbPool;
use crate::pipeline::ingest::{self, Backends, IngestJob, IngestionPipeline, PipelineConfig};
use crate::pipeline::index::IndexStore;
use crate::pipeline::search::{SearchConfig, SearchEngine};

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub data: PathBuf,
    pub db_path: PathBuf,
    pub uploads: PathBuf,
}

/// Everything needed to build an [`AppState`].
pub struct AppSettings {
    pub paths: AppPaths,
    pub pipeline: PipelineConfig,
    pub search: SearchConfig,
    pub ingest_workers: usize,
    pub max_upload_bytes: usize,
}

pub struct AppState {
    pub started_at: std::time::Instant,
    pub paths: AppPaths,
    pub pool: DbPool,
    pub stats: Arc<stats::Stats>,
    pub index: Arc<IndexStore>,
    pub ingest: Arc<IngestionPipeline>,
    pub search: Arc<SearchEngine>,
    pub ingest_tx: Sender<IngestJob>,
    pub max_upload_bytes: usize,
}

impl AppState {
    /// Wire the pipeline and search engine around `pool` and start the
    /// ingest workers. Must be called inside a tokio runtime.
    pub fn start(settings: AppSettings, pool: DbPool, backends: Backends) -> Arc<Self> {
        let stats = Arc::new(stats::Stats::new());
        let index = Arc::new(IndexStore::new());
        let search = Arc::new(SearchEngine::new(
            backends.detector.clone(),
            backends.embedder.clone(),
            pool.clone(),
            index.clone(),
            stats.clone(),
            settings.search,
        ));
        let ingest = Arc::new(IngestionPipeline::new(
            backends,
            pool.clone(),
            index.clone(),
            stats.clone(),
            settings.pipeline,
        ));
        let (ingest_tx, ingest_rx) = ingest::ingest_channel(1024);
        ingest::start_ingest_workers(settings.ingest_workers, ingest_rx, ingest.clone());
        Arc::new(Self {
            started_at: std::time::Instant::now(),
            paths: settings.paths,
            pool,
            stats,
            index,
            ingest,
            search,
            ingest_tx,
            max_upload_bytes: settings.max_upload_bytes,
        })
    }
}
