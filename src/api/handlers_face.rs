use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use crate::error::FacetError;
use crate::models::face::SearchResult;
use crate::AppState;

async fn query_image(multipart: &mut Multipart) -> Result<Vec<u8>, FacetError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| FacetError::InvalidInput(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| FacetError::InvalidInput(format!("query upload interrupted: {}", e)))?;
        if bytes.is_empty() {
            return Err(FacetError::InvalidInput("query image is empty".to_string()));
        }
        return Ok(bytes.to_vec());
    }
    Err(FacetError::InvalidInput("multipart field 'file' is required".to_string()))
}

/// Search one media asset for the face in the uploaded query image.
///
/// A missing face and a not-yet-ready media are answered with a
/// `SearchResult` body so clients can render them like a plain miss.
pub async fn search_media(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    let image = match query_image(&mut multipart).await {
        Ok(bytes) => bytes,
        Err(e) => return e.into_response(),
    };
    match state.search.search(&id, image).await {
        Ok(result) => {
            info!(media_id = %id, found = result.found, "face search");
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(FacetError::NoFaceDetected) => (StatusCode::OK, Json(SearchResult::no_face())).into_response(),
        Err(FacetError::NotReady { status }) => {
            (StatusCode::CONFLICT, Json(SearchResult::not_ready(status))).into_response()
        }
        Err(e) => e.into_response(),
    }
}
