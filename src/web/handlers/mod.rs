pub mod stream;

pub use stream::{audio_stream, combined_stream, snapshot, video_stream};

use axum::{
    extract::State,
    http::Uri,
    response::Html,
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use crate::config::{QualityTier, StreamingMode};
use crate::error::{AppError, Result};
use crate::events::ClientStats;
use crate::sessions::SessionData;
use crate::state::AppState;
use crate::stream::SessionKind;

// ============================================================================
// Info & Status
// ============================================================================

/// Service status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusInfo {
    pub model: String,
    /// `WIDTHxHEIGHT` of the latest frame, or the configured one
    pub resolution: String,
    /// Live streaming clients of all kinds
    pub clients: usize,
    pub mode: StreamingMode,
    pub quality: QualityTier,
    pub video_clients: usize,
    pub audio_clients: usize,
    pub streaming: bool,
    pub uptime_secs: u64,
    pub version: String,
}

fn status_info(state: &AppState) -> StatusInfo {
    let config = state.config.get();
    let registry = &state.registry;

    StatusInfo {
        model: config.device.model.clone(),
        resolution: state.hub.resolution().to_string(),
        clients: registry.total(),
        mode: config.stream.mode,
        quality: config.stream.quality,
        video_clients: registry.count(SessionKind::Video) + registry.count(SessionKind::Combined),
        audio_clients: registry.count(SessionKind::Audio),
        streaming: state.hub.is_streaming(),
        uptime_secs: state.uptime_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// `GET /info`, `GET /api/status`
pub async fn info(State(state): State<Arc<AppState>>) -> Json<StatusInfo> {
    Json(status_info(&state))
}

/// `GET /status` human readable status page
pub async fn status_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let status = status_info(&state);
    let clients = state.registry.clients();

    let mut rows = String::new();
    for c in &clients {
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}s</td></tr>",
            c.id, c.kind, c.state, c.fps, c.frames_sent, c.frames_dropped, c.connected_secs
        );
    }
    if clients.is_empty() {
        rows.push_str("<tr><td colspan=\"7\">No clients connected</td></tr>");
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta http-equiv="refresh" content="5">
    <title>{model} status</title>
    <link rel="stylesheet" href="/assets/style.css">
</head>
<body>
    <h1>{model}</h1>
    <table class="summary">
        <tr><th>Streaming</th><td>{streaming}</td></tr>
        <tr><th>Mode</th><td>{mode}</td></tr>
        <tr><th>Quality</th><td>{quality}</td></tr>
        <tr><th>Resolution</th><td>{resolution}</td></tr>
        <tr><th>Clients</th><td>{total} ({video} video, {audio} audio)</td></tr>
        <tr><th>Logical sessions</th><td>{sessions}</td></tr>
        <tr><th>Uptime</th><td>{uptime}s</td></tr>
    </table>
    <h2>Clients</h2>
    <table class="clients">
        <tr><th>Client</th><th>Kind</th><th>State</th><th>FPS</th><th>Sent</th><th>Dropped</th><th>Connected</th></tr>
        {rows}
    </table>
    <p class="version">v{version}</p>
</body>
</html>"#,
        model = status.model,
        streaming = if status.streaming { "yes" } else { "no" },
        mode = status.mode,
        quality = status.quality,
        resolution = status.resolution,
        total = status.clients,
        video = status.video_clients,
        audio = status.audio_clients,
        sessions = state.sessions.session_count(),
        uptime = status.uptime_secs,
        rows = rows,
        version = status.version,
    ))
}

/// `GET /api/clients` per-connection delivery statistics
pub async fn list_clients(State(state): State<Arc<AppState>>) -> Json<Vec<ClientStats>> {
    Json(state.registry.clients())
}

/// `GET /api/sessions` logical sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionData>> {
    Json(state.sessions.get_all_sessions())
}

// ============================================================================
// Stream Control
// ============================================================================

/// Quality change request
#[derive(Deserialize)]
pub struct SetQualityRequest {
    pub quality: QualityTier,
}

/// Quality change response
#[derive(Serialize)]
pub struct QualityResponse {
    pub success: bool,
    pub quality: QualityTier,
}

/// `POST /api/quality`
pub async fn set_quality(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetQualityRequest>,
) -> Result<Json<QualityResponse>> {
    state.hub.set_quality(req.quality)?;
    Ok(Json(QualityResponse {
        success: true,
        quality: state.hub.quality(),
    }))
}

/// Stream state change response
#[derive(Serialize)]
pub struct StreamStateResponse {
    pub success: bool,
    pub streaming: bool,
    /// Sessions closed by the change
    pub evicted: usize,
}

/// `POST /api/stream/start`
pub async fn stream_start(State(state): State<Arc<AppState>>) -> Json<StreamStateResponse> {
    state.hub.start();
    Json(StreamStateResponse {
        success: true,
        streaming: state.hub.is_streaming(),
        evicted: 0,
    })
}

/// `POST /api/stream/stop`
pub async fn stream_stop(State(state): State<Arc<AppState>>) -> Json<StreamStateResponse> {
    let evicted = state.hub.stop();
    if evicted > 0 {
        info!(evicted, "Stream stopped via API");
    }
    Json(StreamStateResponse {
        success: true,
        streaming: state.hub.is_streaming(),
        evicted,
    })
}

/// Anything not routed
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}
