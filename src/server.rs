//! HTTP server lifecycle
//!
//! [`StreamServer::bind`] claims the listening socket up front, so a port
//! conflict is reported to the caller before anything else starts.
//! [`StreamServer::run`] serves until the shutdown token is cancelled,
//! then waits a bounded grace period for delivery loops to finish.

use axum::serve;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::events::spawn_event_logger;
use crate::state::AppState;
use crate::utils::{bind_tcp_listener, parse_bind_ip};
use crate::web;

/// Bound, not yet running streaming server
pub struct StreamServer {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
}

impl StreamServer {
    /// Bind the configured address and build the application state
    pub fn bind(config: ConfigStore) -> Result<Self> {
        let cfg = config.get();
        let ip = parse_bind_ip(&cfg.server.bind_address).ok_or_else(|| {
            AppError::Config(format!("Invalid bind address: {}", cfg.server.bind_address))
        })?;
        let addr = SocketAddr::new(ip, cfg.server.http_port);

        let listener = bind_tcp_listener(addr).map_err(|source| AppError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            state: AppState::new(config),
        })
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Serve until shutdown
    pub async fn run(self) -> Result<()> {
        let StreamServer {
            listener,
            local_addr,
            state,
        } = self;
        let grace = Duration::from_secs(state.config.get().server.shutdown_grace_secs);

        let event_logger = spawn_event_logger(&state.events, state.shutdown.clone());
        let sweeper = state.sessions.start_sweeper(state.shutdown.clone());
        let app = web::create_router(state.clone());
        let listener = tokio::net::TcpListener::from_std(listener)?;

        info!("Starting HTTP server on {}", local_addr);
        let token = state.shutdown.clone();
        let server = serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await });
        let mut server = tokio::spawn(async move { server.await });

        let mut result = Ok(());
        tokio::select! {
            _ = state.shutdown.cancelled() => {}
            res = &mut server => {
                // Serving stopped on its own; bring everything else down
                result = flatten(res);
                if let Err(e) = &result {
                    tracing::error!("HTTP server error: {}", e);
                }
                state.shutdown.cancel();
            }
        }

        info!(clients = state.registry.total(), "Shutting down");

        state.tracker.close();
        if timeout(grace, state.tracker.wait()).await.is_err() {
            warn!(
                remaining = state.registry.total(),
                "Delivery loops still running after {:?}", grace
            );
        }

        state.sessions.shutdown();
        let _ = sweeper.await;
        if let Ok(logged) = event_logger.await {
            tracing::debug!(logged, "Event logger stopped");
        }

        if !server.is_finished() {
            match timeout(grace, &mut server).await {
                Ok(res) => result = result.and(flatten(res)),
                Err(_) => {
                    warn!("HTTP connections still open after {:?}, aborting", grace);
                    server.abort();
                }
            }
        }

        info!("Server shutdown complete");
        result
    }
}

fn flatten(res: std::result::Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::Io(e)),
        Err(e) => Err(AppError::Internal(format!("server task failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, StreamingMode};
    use crate::stream::SessionKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0xFF, 0xD9];

    struct TestServer {
        addr: SocketAddr,
        state: Arc<AppState>,
        handle: JoinHandle<Result<()>>,
    }

    fn start_with(configure: impl FnOnce(&mut AppConfig)) -> TestServer {
        let mut config = AppConfig::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.http_port = 0;
        config.server.shutdown_grace_secs = 2;
        configure(&mut config);

        let server = StreamServer::bind(ConfigStore::new(config)).unwrap();
        let addr = server.local_addr();
        let state = server.state().clone();
        let handle = tokio::spawn(server.run());
        TestServer {
            addr,
            state,
            handle,
        }
    }

    fn start() -> TestServer {
        start_with(|_| {})
    }

    /// One-shot request; returns (status, headers, body)
    async fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        stream.write_all(req.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
            .await
            .unwrap()
            .unwrap();

        let split = find(&raw, b"\r\n\r\n").unwrap();
        let head = String::from_utf8(raw[..split].to_vec()).unwrap();
        let status = head[9..12].parse().unwrap();
        (status, head, raw[split + 4..].to_vec())
    }

    async fn get(addr: SocketAddr, path: &str) -> (u16, String, Vec<u8>) {
        request(addr, "GET", path, "").await
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Open streaming response read chunk by chunk
    struct StreamClient {
        stream: TcpStream,
        buf: Vec<u8>,
        head: String,
    }

    impl StreamClient {
        async fn open(addr: SocketAddr, path: &str) -> Self {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let req = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
            stream.write_all(req.as_bytes()).await.unwrap();

            let mut client = Self {
                stream,
                buf: Vec::new(),
                head: String::new(),
            };
            let split = loop {
                if let Some(i) = find(&client.buf, b"\r\n\r\n") {
                    break i;
                }
                assert!(client.fill().await > 0, "connection closed before headers");
            };
            client.head = String::from_utf8(client.buf[..split].to_vec()).unwrap();
            client.buf.drain(..split + 4);
            client
        }

        async fn fill(&mut self) -> usize {
            let mut tmp = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut tmp))
                .await
                .expect("read in time")
                .unwrap_or(0);
            self.buf.extend_from_slice(&tmp[..n]);
            n
        }

        /// Next chunk of the chunked body; `None` at the terminating chunk or EOF
        async fn chunk(&mut self) -> Option<Vec<u8>> {
            loop {
                if let Some(line_end) = find(&self.buf, b"\r\n") {
                    let size_line = String::from_utf8(self.buf[..line_end].to_vec()).unwrap();
                    let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
                    if size == 0 {
                        return None;
                    }
                    let total = line_end + 2 + size + 2;
                    if self.buf.len() >= total {
                        let data = self.buf[line_end + 2..line_end + 2 + size].to_vec();
                        self.buf.drain(..total);
                        return Some(data);
                    }
                }
                if self.fill().await == 0 {
                    return None;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_video_stream_delivers_published_frame() {
        let server = start();
        server.state.hub.publish_jpeg(JPEG.to_vec(), None).unwrap();

        let mut client = StreamClient::open(server.addr, "/video").await;
        assert!(client.head.starts_with("HTTP/1.1 200"));
        let head = client.head.to_ascii_lowercase();
        assert!(head.contains("content-type: multipart/x-mixed-replace; boundary=camcastframe"));
        assert!(head.contains("cache-control: no-cache, no-store, must-revalidate"));

        assert_eq!(client.chunk().await.unwrap(), b"--camcastframe\r\n");

        let part = client.chunk().await.unwrap();
        let body_start = find(&part, b"\r\n\r\n").unwrap() + 4;
        assert!(part.starts_with(b"Content-Type: image/jpeg\r\n"));
        assert_eq!(&part[body_start..body_start + JPEG.len()], JPEG);
        assert!(part.ends_with(b"\r\n--camcastframe\r\n"));

        // Frames published later follow on the same connection
        let mut second = JPEG.to_vec();
        second[6] = b'X';
        server.state.hub.publish_jpeg(second.clone(), None).unwrap();
        let part = client.chunk().await.unwrap();
        assert!(find(&part, &second).is_some());

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_audio_stream_headers() {
        let server = start();
        let mut client = StreamClient::open(server.addr, "/audio").await;
        assert!(client
            .head
            .to_ascii_lowercase()
            .contains("boundary=camcastaudio"));
        assert_eq!(client.chunk().await.unwrap(), b"--camcastaudio\r\n");

        server.state.hub.publish_audio(vec![1u8; 256]).unwrap();
        let part = client.chunk().await.unwrap();
        assert!(part.starts_with(b"Content-Type: audio/pcm;rate=44100;channels=2;bits=16\r\n"));

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_404_then_jpeg() {
        let server = start();

        let (status, _, _) = get(server.addr, "/image").await;
        assert_eq!(status, 404);

        server.state.hub.publish_jpeg(JPEG.to_vec(), None).unwrap();
        let (status, head, body) = get(server.addr, "/snapshot").await;
        assert_eq!(status, 200);
        assert!(head.to_ascii_lowercase().contains("content-type: image/jpeg"));
        assert_eq!(body, JPEG);

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_json_counts_clients() {
        let server = start();
        let mut client = StreamClient::open(server.addr, "/stream").await;
        client.chunk().await.unwrap();

        let (status, _, body) = get(server.addr, "/api/status").await;
        assert_eq!(status, 200);
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["model"], "camcast");
        assert_eq!(info["resolution"], "1280x720");
        assert_eq!(info["clients"], 1);
        assert_eq!(info["video_clients"], 1);
        assert_eq!(info["mode"], "video_audio");
        assert_eq!(info["streaming"], true);
        assert_eq!(server.state.registry.count(SessionKind::Combined), 1);

        let (status, _, body) = get(server.addr, "/info").await;
        assert_eq!(status, 200);
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["quality"], "medium");

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_path_and_disabled_kind() {
        let server = start_with(|c| c.stream.mode = StreamingMode::VideoOnly);

        let (status, _, body) = get(server.addr, "/nope").await;
        assert_eq!(status, 404);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["success"], false);

        let (status, _, _) = get(server.addr, "/audio").await;
        assert_eq!(status, 503);
        assert_eq!(server.state.registry.total(), 0);

        let (status, head, _) = get(server.addr, "/").await;
        assert_eq!(status, 200);
        assert!(head.to_ascii_lowercase().contains("text/html"));

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_evicts_and_rejects_streams() {
        let server = start();
        let mut client = StreamClient::open(server.addr, "/video").await;
        client.chunk().await.unwrap();

        let (status, _, body) = request(server.addr, "POST", "/api/stream/stop", "").await;
        assert_eq!(status, 200);
        let resp: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp["evicted"], 1);
        assert_eq!(resp["streaming"], false);

        // Evicted stream terminates
        assert!(client.chunk().await.is_none());
        let (status, _, _) = get(server.addr, "/video").await;
        assert_eq!(status, 503);

        let (status, _, _) = request(server.addr, "POST", "/api/stream/start", "").await;
        assert_eq!(status, 200);
        assert!(server.state.hub.is_streaming());

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_quality_endpoint() {
        let server = start();

        let (status, _, body) =
            request(server.addr, "POST", "/api/quality", r#"{"quality":"high"}"#).await;
        assert_eq!(status, 200);
        let resp: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp["quality"], "high");
        assert_eq!(
            server.state.config.get().stream.quality,
            crate::config::QualityTier::High
        );

        let (status, _, _) =
            request(server.addr, "POST", "/api/quality", r#"{"quality":"ultra"}"#).await;
        assert!(status == 400 || status == 422);

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_requests_create_logical_sessions() {
        let server = start();
        get(server.addr, "/info").await;
        get(server.addr, "/info").await;

        let (_, _, body) = get(server.addr, "/api/sessions").await;
        let sessions: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let sessions = sessions.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["client_ip"], "127.0.0.1");

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_clients_counted() {
        let server = start();
        let clients = futures::future::join_all(
            (0..20).map(|_| StreamClient::open(server.addr, "/video")),
        )
        .await;
        assert_eq!(server.state.registry.count(SessionKind::Video), 20);
        assert_eq!(server.state.registry.clients().len(), 20);

        drop(clients);
        // Dead sockets are noticed on the next writes
        timeout(Duration::from_secs(5), async {
            while server.state.registry.total() > 0 {
                let _ = server.state.hub.publish_jpeg(JPEG.to_vec(), None);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        server.state.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = AppConfig::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.http_port = port;

        let err = StreamServer::bind(ConfigStore::new(config)).err().unwrap();
        assert!(matches!(err, AppError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams() {
        let server = start();
        let mut video = StreamClient::open(server.addr, "/video").await;
        let mut audio = StreamClient::open(server.addr, "/audio").await;
        video.chunk().await.unwrap();
        audio.chunk().await.unwrap();
        assert_eq!(server.state.registry.total(), 2);

        server.state.shutdown.cancel();
        timeout(Duration::from_secs(5), server.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(video.chunk().await.is_none());
        assert!(audio.chunk().await.is_none());
        assert_eq!(server.state.registry.total(), 0);
    }
}
