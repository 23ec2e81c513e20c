use std::net::SocketAddr;
use std::sync::Arc;

use facet_engine::db;
use facet_engine::pipeline::sampler::FfmpegDecoder;
use facet_engine::pipeline::Backends;
use facet_engine::utils::config::Config;
use facet_engine::utils::{ffmpeg, logging};
use facet_engine::{AppPaths, AppSettings, AppState};
use tracing::{info, warn};

#[cfg(feature = "facial-recognition")]
async fn face_backends(cfg: &Config) -> anyhow::Result<Backends> {
    use facet_engine::pipeline::face::{load_models, ModelOptions};

    let opts = ModelOptions {
        models_dir: cfg.models_dir(),
        auto_download: cfg.face_auto_download,
        use_gpu: cfg.face_use_gpu,
    };
    let (detector, embedder) = load_models(&opts).await?;
    Ok(Backends {
        decoder: Arc::new(FfmpegDecoder::new()),
        detector: Arc::new(detector),
        embedder: Arc::new(embedder),
    })
}

#[cfg(not(feature = "facial-recognition"))]
async fn face_backends(_cfg: &Config) -> anyhow::Result<Backends> {
    anyhow::bail!("built without the facial-recognition feature; no detector or embedder available")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = Config::from_env();

    let db_path = cfg.db_path();
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let uploads = cfg.uploads_dir();
    std::fs::create_dir_all(&uploads)?;
    std::fs::create_dir_all(cfg.models_dir())?;

    let pool = db::create_pool(&db_path, cfg.db_pool_size)?;
    {
        let conn = pool.get()?;
        let interrupted = db::writer::fail_interrupted(&conn)?;
        if interrupted > 0 {
            warn!("marked {} interrupted ingestion(s) as failed", interrupted);
        }
    }

    if !ffmpeg::tools_available() {
        warn!("ffmpeg/ffprobe not found on PATH; video ingestion will fail until they are installed");
    }

    let backends = face_backends(&cfg).await?;
    let settings = AppSettings {
        paths: AppPaths { data: cfg.data.clone(), db_path: db_path.clone(), uploads },
        pipeline: cfg.pipeline(),
        search: cfg.search(),
        ingest_workers: cfg.ingest_workers.max(1),
        max_upload_bytes: (cfg.max_upload_mb as usize).saturating_mul(1024 * 1024),
    };
    let state = AppState::start(settings, pool, backends);

    let app = facet_engine::api::routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
