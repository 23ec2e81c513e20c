use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;

use crate::api::{handlers, handlers_face};
use crate::AppState;

async fn count_requests(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    state.stats.inc_requests();
    next.run(req).await
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(vec![axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/media", get(handlers::list_media).post(handlers::upload_media))
        .route("/media/:id", get(handlers::get_media))
        .route("/media/:id/reindex", post(handlers::reindex_media))
        .route("/media/:id/search", post(handlers_face::search_media))
        .nest_service("/uploads", ServeDir::new(&state.paths.uploads))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .layer(cors)
        .with_state(state)
}
