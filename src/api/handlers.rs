use std::path::Path as StdPath;
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::db;
use crate::error::FacetError;
use crate::models::media::{MediaAsset, MediaStatus, MediaView};
use crate::pipeline::IngestJob;
use crate::AppState;

/// Run a blocking query against a pooled connection.
pub(crate) async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, FacetError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
{
    let pool = state.pool.clone();
    let out = tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
        let conn = pool.get()?;
        f(&conn)
    })
    .await??;
    Ok(out)
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, FacetError> {
    let counts = with_conn(&state, db::query::count_media_by_status).await?;
    let body = state.stats.metrics_text(&counts);
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

pub async fn list_media(State(state): State<Arc<AppState>>) -> Result<Json<Vec<MediaView>>, FacetError> {
    let media = with_conn(&state, db::query::list_media).await?;
    Ok(Json(media.into_iter().map(MediaView::from).collect()))
}

pub async fn get_media(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MediaView>, FacetError> {
    let lookup = id.clone();
    match with_conn(&state, move |conn| db::query::get_media(conn, &lookup)).await? {
        Some(media) => Ok(Json(media.into())),
        None => Err(FacetError::NotFound(id)),
    }
}

/// Keep only the final path component of a client-supplied name.
fn sanitize_filename(name: &str) -> String {
    let base = StdPath::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .trim();
    if base.is_empty() {
        "upload.mp4".to_string()
    } else {
        base.to_string()
    }
}

fn video_extension(filename: &str) -> Result<String, FacetError> {
    if let Some(mime) = mime_guess::from_path(filename).first() {
        if mime.type_() != mime_guess::mime::VIDEO {
            return Err(FacetError::InvalidInput(format!("{} is not a video ({})", filename, mime)));
        }
    }
    let ext = StdPath::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "mp4".to_string());
    Ok(ext)
}

pub async fn upload_media(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, FacetError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| FacetError::InvalidInput(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = sanitize_filename(field.file_name().unwrap_or(""));
        let ext = video_extension(&filename)?;
        let id = uuid::Uuid::new_v4().to_string();
        let stored_filename = format!("{}.{}", id, ext);
        let dest = state.paths.uploads.join(&stored_filename);

        let mut file = tokio::fs::File::create(&dest).await.map_err(anyhow::Error::from)?;
        let mut written = 0usize;
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&dest).await;
                    return Err(FacetError::InvalidInput(format!("upload interrupted: {}", e)));
                }
            };
            written += chunk.len();
            file.write_all(&chunk).await.map_err(anyhow::Error::from)?;
        }
        file.flush().await.map_err(anyhow::Error::from)?;
        drop(file);
        if written == 0 {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(FacetError::InvalidInput("uploaded file is empty".to_string()));
        }

        let now = chrono::Utc::now().timestamp();
        let media = MediaAsset {
            id: id.clone(),
            filename,
            stored_filename,
            status: MediaStatus::Pending,
            duration_secs: None,
            face_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        let row = media.clone();
        with_conn(&state, move |conn| db::writer::insert_media(conn, &row)).await?;
        state.stats.inc_uploads();
        info!(media_id = %id, bytes = written, "video uploaded: {}", media.filename);

        enqueue(&state, &id, dest).await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "media_id": id, "status": MediaStatus::Pending })),
        ));
    }
    Err(FacetError::InvalidInput("multipart field 'file' is required".to_string()))
}

async fn enqueue(state: &AppState, media_id: &str, source: std::path::PathBuf) -> Result<(), FacetError> {
    let job = IngestJob { media_id: media_id.to_string(), source };
    if state.ingest_tx.send(job).await.is_err() {
        warn!(media_id = %media_id, "ingest queue closed");
        let id = media_id.to_string();
        let _ = with_conn(state, move |conn| db::writer::mark_failed(conn, &id, "ingest queue unavailable")).await;
        return Err(FacetError::Internal(anyhow::anyhow!("ingest queue unavailable")));
    }
    Ok(())
}

pub async fn reindex_media(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, FacetError> {
    let lookup = id.clone();
    let media = with_conn(&state, move |conn| db::query::get_media(conn, &lookup))
        .await?
        .ok_or_else(|| FacetError::NotFound(id.clone()))?;
    if media.status == MediaStatus::Processing || state.ingest.is_in_flight(&id) {
        return Err(FacetError::AlreadyProcessing(id));
    }
    let source = state.paths.uploads.join(&media.stored_filename);
    info!(media_id = %id, "reindex requested (currently {})", media.status);
    enqueue(&state, &id, source).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "media_id": id, "status": media.status })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_reduced_to_basename() {
        assert_eq!(sanitize_filename("../../etc/clip.mp4"), "clip.mp4");
        assert_eq!(sanitize_filename(""), "upload.mp4");
        assert_eq!(sanitize_filename("holiday.MOV"), "holiday.MOV");
    }

    #[test]
    fn only_video_extensions_are_accepted() {
        assert_eq!(video_extension("holiday.MOV").unwrap(), "mov");
        assert_eq!(video_extension("clip").unwrap(), "mp4");
        assert!(matches!(video_extension("face.jpg"), Err(FacetError::InvalidInput(_))));
    }
}
