use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

use crate::models::media::MediaStatus;

/// Failures surfaced by ingestion and search.
///
/// Infrastructure code (SQLite, ffmpeg plumbing, model loading) works in
/// `anyhow::Result`; it is folded into `Internal` at the domain boundary.
#[derive(Debug, Error)]
pub enum FacetError {
    #[error("video could not be decoded: {0}")]
    Decode(String),
    #[error("model inference failed: {0}")]
    ModelInference(String),
    #[error("no face detected in query image")]
    NoFaceDetected,
    #[error("media is not ready (status: {status})")]
    NotReady { status: MediaStatus },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("media not found: {0}")]
    NotFound(String),
    #[error("media {0} is already being processed")]
    AlreadyProcessing(String),
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FacetError {
    /// Stable machine-readable code, shared with the search response body.
    pub fn code(&self) -> &'static str {
        match self {
            FacetError::Decode(_) => "decode_error",
            FacetError::ModelInference(_) => "model_inference_error",
            FacetError::NoFaceDetected => "no_face_in_query",
            FacetError::NotReady { .. } => "not_ready",
            FacetError::Timeout(_) => "timeout",
            FacetError::NotFound(_) => "not_found",
            FacetError::AlreadyProcessing(_) => "already_processing",
            FacetError::InvalidInput(_) => "invalid_request",
            FacetError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FacetError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FacetError::ModelInference(_) => StatusCode::BAD_REQUEST,
            FacetError::NoFaceDetected => StatusCode::OK,
            FacetError::NotReady { .. } => StatusCode::CONFLICT,
            FacetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FacetError::NotFound(_) => StatusCode::NOT_FOUND,
            FacetError::AlreadyProcessing(_) => StatusCode::CONFLICT,
            FacetError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FacetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio::task::JoinError> for FacetError {
    fn from(e: tokio::task::JoinError) -> Self {
        FacetError::Internal(anyhow::anyhow!("worker task failed: {}", e))
    }
}

impl IntoResponse for FacetError {
    fn into_response(self) -> axum::response::Response {
        if let FacetError::Internal(ref e) = self {
            tracing::error!("internal error: {:#}", e);
        }
        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let FacetError::NotReady { status } = &self {
            body["status"] = serde_json::json!(status);
        }
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_carries_status_in_message() {
        let err = FacetError::NotReady { status: MediaStatus::Processing };
        assert_eq!(err.to_string(), "media is not ready (status: processing)");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "not_ready");
    }

    #[test]
    fn internal_wraps_anyhow() {
        let err: FacetError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.code(), "internal_error");
        assert_eq!(err.to_string(), "disk full");
    }
}
