use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::state::AppState;

/// Refresh the logical session of the requesting client
///
/// Every request counts as activity; the first one from an address
/// creates its session.
pub async fn track_client(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let mode = state.config.get().stream.mode;
    state.sessions.touch_client(&remote.ip().to_string(), mode);
    next.run(request).await
}
