//! Streaming and snapshot endpoints

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::stream::{
    ClientGuard, ClientId, ClientSession, DeliveryLoop, MultipartEncoder, SessionKind,
};
use crate::state::AppState;

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// `GET /video` continuous MJPEG stream
pub async fn video_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Response> {
    open_stream(&state, remote, SessionKind::Video)
}

/// `GET /audio` continuous PCM chunk stream
pub async fn audio_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Response> {
    open_stream(&state, remote, SessionKind::Audio)
}

/// `GET /stream` combined stream; currently carries video only
pub async fn combined_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Response> {
    open_stream(&state, remote, SessionKind::Combined)
}

/// Register a session and answer with its multipart body
///
/// Headers go out immediately; the delivery loop runs as a tracked task
/// and feeds the body through a capacity-one channel.
fn open_stream(state: &Arc<AppState>, remote: SocketAddr, kind: SessionKind) -> Result<Response> {
    let config = state.config.get();
    let media = kind.media();

    if !config.stream.mode.supports(media) {
        return Err(AppError::ServiceUnavailable(format!(
            "{} streaming is not available in {} mode",
            media, config.stream.mode
        )));
    }
    if !state.hub.is_streaming() || state.is_shutting_down() {
        return Err(AppError::ServiceUnavailable("Stream is stopped".to_string()));
    }

    // Taken before registering so fan-out can only repeat this exact frame
    let initial = state.hub.bus().current(media);

    let id = ClientId {
        conn_id: state.next_conn_id(),
        remote,
    };
    let (session, queue) =
        ClientSession::new(id, kind, config.stream.queue_depth, &state.shutdown);
    let guard = ClientGuard::register(session, state.registry.clone(), state.events.clone())?;

    // Lost a race with stop(): the eviction pass did not see this session
    if !state.hub.is_streaming() {
        guard.close();
        return Err(AppError::ServiceUnavailable("Stream is stopped".to_string()));
    }

    // A long-lived stream keeps its logical session from expiring
    let sessions = state.sessions.clone();
    let client_ip = remote.ip().to_string();
    let mode = config.stream.mode;
    let touch_every = Duration::from_secs((config.session.idle_timeout_secs / 2).max(1));

    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    let delivery = DeliveryLoop::new(guard, queue, tx, state.encoder.clone())
        .with_max_fps(config.stream.max_fps)
        .with_keepalive(Duration::from_secs(config.stream.keepalive_secs))
        .with_initial_frame(initial)
        .with_activity(touch_every, move || {
            sessions.touch_client(&client_ip, mode);
        });
    state.tracker.spawn(delivery.run());

    let body_stream = async_stream::stream! {
        while let Some(data) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(data);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MultipartEncoder::content_type(media))
        .header(header::CACHE_CONTROL, NO_CACHE)
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// `GET /image`, `GET /snapshot`: the current frame as a single JPEG
pub async fn snapshot(State(state): State<Arc<AppState>>) -> Result<Response> {
    let mode = state.config.get().stream.mode;
    if !mode.supports_snapshot() {
        return Err(AppError::ServiceUnavailable(format!(
            "Snapshots are not available in {} mode",
            mode
        )));
    }

    match state.hub.bus().current_frame() {
        Some(frame) if frame.is_valid_jpeg() => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .header(header::CONTENT_LENGTH, frame.len())
            .header(header::CACHE_CONTROL, NO_CACHE)
            .body(Body::from(frame.data_bytes()))
            .map_err(|e| AppError::Internal(e.to_string())),
        _ => Err(AppError::NotFound("No frame available yet".to_string())),
    }
}
