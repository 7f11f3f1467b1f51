use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::media::{AudioFormat, Resolution, StreamKind};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Streaming settings
    pub stream: StreamConfig,
    /// Audio payload description
    pub audio: AudioFormat,
    /// Logical session settings
    pub session: SessionConfig,
    /// Device description reported by `/info`
    pub device: DeviceConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
    /// How long shutdown waits for delivery loops to exit
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
            shutdown_grace_secs: 5,
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-client outbound queue capacity (frames)
    pub queue_depth: usize,
    /// Quality tier applied by the encode step
    pub quality: QualityTier,
    /// Delivery frame rate ceiling per client (0 = unpaced)
    pub max_fps: u32,
    /// Re-send the last frame after this many idle seconds (0 = never)
    pub keepalive_secs: u64,
    /// Which media the service carries
    pub mode: StreamingMode,
    /// Resolution reported before the first frame arrives
    pub resolution: Resolution,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_depth: 10,
            quality: QualityTier::Medium,
            max_fps: 30,
            keepalive_secs: 5,
            mode: StreamingMode::VideoAudio,
            resolution: Resolution::HD720,
        }
    }
}

/// Logical session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session expires
    pub idle_timeout_secs: u64,
    /// Sweep period
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

/// Device description
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Model name
    pub model: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            model: "camcast".to_string(),
        }
    }
}

/// Stream quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    /// JPEG quality used by the encode step
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            QualityTier::Low => 50,
            QualityTier::Medium => 70,
            QualityTier::High => 90,
        }
    }

    /// Nominal capture resolution for the tier
    pub fn resolution(&self) -> Resolution {
        match self {
            QualityTier::Low => Resolution::VGA,
            QualityTier::Medium => Resolution::HD720,
            QualityTier::High => Resolution::HD1080,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::Low => write!(f, "low"),
            QualityTier::Medium => write!(f, "medium"),
            QualityTier::High => write!(f, "high"),
        }
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(QualityTier::Low),
            "medium" => Ok(QualityTier::Medium),
            "high" => Ok(QualityTier::High),
            other => Err(format!(
                "Invalid quality '{}'. Valid values: low, medium, high",
                other
            )),
        }
    }
}

/// Which media the service carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    /// Snapshots only
    ImageOnly,
    AudioOnly,
    VideoOnly,
    VideoAudio,
}

impl StreamingMode {
    /// Whether a continuous stream of `kind` is served in this mode
    pub fn supports(&self, kind: StreamKind) -> bool {
        matches!(
            (self, kind),
            (StreamingMode::VideoOnly | StreamingMode::VideoAudio, StreamKind::Video)
                | (StreamingMode::AudioOnly | StreamingMode::VideoAudio, StreamKind::Audio)
        )
    }

    /// Whether `/image` snapshots are served in this mode
    pub fn supports_snapshot(&self) -> bool {
        !matches!(self, StreamingMode::AudioOnly)
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamingMode::ImageOnly => write!(f, "image_only"),
            StreamingMode::AudioOnly => write!(f, "audio_only"),
            StreamingMode::VideoOnly => write!(f, "video_only"),
            StreamingMode::VideoAudio => write!(f, "video_audio"),
        }
    }
}

impl FromStr for StreamingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "image_only" | "image" => Ok(StreamingMode::ImageOnly),
            "audio_only" | "audio" => Ok(StreamingMode::AudioOnly),
            "video_only" | "video" => Ok(StreamingMode::VideoOnly),
            "video_audio" | "stream" => Ok(StreamingMode::VideoAudio),
            other => Err(format!(
                "Invalid mode '{}'. Valid modes: image_only, audio_only, video_only, video_audio",
                other
            )),
        }
    }
}
