use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::middleware::track_client;
use super::static_files::static_file_router;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Long-lived multipart streams and single-frame snapshots
    let stream_routes = Router::new()
        .route("/video", get(handlers::video_stream))
        .route("/audio", get(handlers::audio_stream))
        .route("/stream", get(handlers::combined_stream))
        .route("/image", get(handlers::snapshot))
        .route("/snapshot", get(handlers::snapshot));

    let info_routes = Router::new()
        .route("/info", get(handlers::info))
        .route("/status", get(handlers::status_page));

    let api_routes = Router::new()
        .route("/status", get(handlers::info))
        .route("/clients", get(handlers::list_clients))
        .route("/sessions", get(handlers::list_sessions))
        .route("/quality", post(handlers::set_quality))
        .route("/stream/start", post(handlers::stream_start))
        .route("/stream/stop", post(handlers::stream_stop));

    Router::new()
        .merge(stream_routes)
        .merge(info_routes)
        .nest("/api", api_routes)
        .merge(static_file_router())
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), track_client))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
