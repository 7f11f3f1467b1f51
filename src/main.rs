use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camcast::config::{ConfigStore, QualityTier, StreamingMode};
use camcast::stream::StreamHub;
use camcast::StreamServer;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "camcast")]
#[command(version, about = "Live camera and microphone streaming over HTTP", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML); defaults apply when missing
    #[arg(short = 'c', long, value_name = "FILE", default_value = "camcast.toml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Per-client frame queue depth (overrides config)
    #[arg(long, value_name = "FRAMES")]
    queue_depth: Option<usize>,

    /// Quality tier: low, medium, high (overrides config)
    #[arg(long, value_name = "TIER")]
    quality: Option<QualityTier>,

    /// Streaming mode: image_only, audio_only, video_only, video_audio (overrides config)
    #[arg(long, value_name = "MODE")]
    mode: Option<StreamingMode>,

    /// Delivery frame rate ceiling, 0 for unlimited (overrides config)
    #[arg(long, value_name = "FPS")]
    max_fps: Option<u32>,

    /// Publish the *.jpg files of this directory in a loop (demo producer)
    #[arg(long, value_name = "DIR")]
    source_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camcast v{}", env!("CARGO_PKG_VERSION"));

    let config = ConfigStore::load(&args.config).await?;
    config.update("cli", |cfg| {
        if let Some(address) = &args.address {
            cfg.server.bind_address = address.clone();
        }
        if let Some(port) = args.port {
            cfg.server.http_port = port;
        }
        if let Some(depth) = args.queue_depth {
            cfg.stream.queue_depth = depth;
        }
        if let Some(quality) = args.quality {
            cfg.stream.quality = quality;
            cfg.stream.resolution = quality.resolution();
        }
        if let Some(mode) = args.mode {
            cfg.stream.mode = mode;
        }
        if let Some(max_fps) = args.max_fps {
            cfg.stream.max_fps = max_fps;
        }
    })?;

    let current = config.get();
    tracing::info!(
        mode = %current.stream.mode,
        quality = %current.stream.quality,
        queue_depth = current.stream.queue_depth,
        "Stream configuration"
    );

    // Bind failure is fatal and reported here
    let server = StreamServer::bind(config.clone())?;
    let shutdown = server.shutdown_token();

    if let Some(dir) = args.source_dir {
        let fps = match current.stream.max_fps {
            0 => 30,
            fps => fps,
        };
        let hub = server.state().hub.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_demo_producer(&dir, fps, hub, token).await {
                tracing::error!("Demo producer stopped: {:#}", e);
            }
        });
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for CTRL+C: {}", e),
        }
        signal_token.cancel();
    });

    server.run().await?;
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camcast=error,tower_http=error",
        LogLevel::Warn => "camcast=warn,tower_http=warn",
        LogLevel::Info => "camcast=info,tower_http=info",
        LogLevel::Verbose => "camcast=debug,tower_http=info",
        LogLevel::Debug => "camcast=debug,tower_http=debug",
        LogLevel::Trace => "camcast=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Cycle through the JPEG files of `dir` at `fps` until cancelled
async fn run_demo_producer(
    dir: &Path,
    fps: u32,
    hub: Arc<StreamHub>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_jpeg = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
        if is_jpeg {
            paths.push(path);
        }
    }
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in &paths {
        frames.push(bytes::Bytes::from(tokio::fs::read(path).await?));
    }
    if frames.is_empty() {
        anyhow::bail!("no JPEG files in {}", dir.display());
    }
    tracing::info!(
        "Demo producer publishing {} frames from {} at {} fps",
        frames.len(),
        dir.display(),
        fps
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    for frame in frames.iter().cycle() {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = hub.publish_jpeg(frame.clone(), None) {
                    tracing::debug!("Demo frame rejected: {}", e);
                }
            }
        }
    }
    Ok(())
}
