use axum::{
    extract::Path,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rust_embed::Embed;

use crate::error::AppError;

/// Control page and its assets
#[derive(Embed)]
#[folder = "web/"]
#[prefix = ""]
pub struct StaticAssets;

/// Create router for static file serving
pub fn static_file_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(index_handler))
        .route("/assets/*path", get(asset_handler))
}

/// Serve index.html for root path
async fn index_handler() -> Response {
    try_serve_file("index.html").unwrap_or_else(|| {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            placeholder_html(),
        )
            .into_response()
    })
}

/// Serve files below `assets/`
async fn asset_handler(Path(path): Path<String>) -> Response {
    if path.split('/').any(|segment| segment == "..") {
        tracing::warn!("Path traversal attempt blocked: {}", path);
        return AppError::NotFound(path).into_response();
    }

    let path = format!("assets/{}", path);
    try_serve_file(&path).unwrap_or_else(|| AppError::NotFound(path).into_response())
}

fn try_serve_file(path: &str) -> Option<Response> {
    let asset = StaticAssets::get(path)?;
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    Some(
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime),
                (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
            ],
            asset.data.into_owned(),
        )
            .into_response(),
    )
}

/// Fallback page when the control page is missing from the build
pub fn placeholder_html() -> &'static str {
    r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>camcast</title>
</head>
<body>
    <h1>camcast</h1>
    <p><a href="/video">Video</a> | <a href="/audio">Audio</a> | <a href="/status">Status</a></p>
</body>
</html>"#
}
