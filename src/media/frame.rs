//! Media frame data structures

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Kind of media carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// JPEG encoded video frame
    Video,
    /// Raw PCM audio chunk
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// Frame dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Common resolutions
    pub const VGA: Resolution = Resolution::new(640, 480);
    pub const HD720: Resolution = Resolution::new(1280, 720);
    pub const HD1080: Resolution = Resolution::new(1920, 1080);

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An encoded media frame
///
/// Immutable once produced. Cloning is cheap: the payload is a
/// reference-counted `Bytes`, so every client queue shares one buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    /// Media kind
    pub kind: StreamKind,
    /// Monotonic per-kind sequence number (diagnostics only)
    pub sequence: u64,
    /// Wall-clock capture time
    pub timestamp: DateTime<Utc>,
    /// Monotonic capture time
    pub captured_at: Instant,
    /// Video dimensions, if known
    pub resolution: Option<Resolution>,
}

impl Frame {
    /// Create a new frame
    pub fn new(data: Bytes, kind: StreamKind, sequence: u64) -> Self {
        Self {
            data,
            kind,
            sequence,
            timestamp: Utc::now(),
            captured_at: Instant::now(),
            resolution: None,
        }
    }

    /// Create a JPEG video frame
    pub fn video(data: Bytes, resolution: Option<Resolution>, sequence: u64) -> Self {
        Self {
            resolution,
            ..Self::new(data, StreamKind::Video, sequence)
        }
    }

    /// Create a PCM audio frame
    pub fn audio(data: Bytes, sequence: u64) -> Self {
        Self::new(data, StreamKind::Audio, sequence)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get age of this frame (time since capture)
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }

    /// Capture time in milliseconds since the Unix epoch
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Whether `other` is a clone of this very frame (shared payload and sequence)
    pub fn same_publish(&self, other: &Frame) -> bool {
        self.sequence == other.sequence
            && self.data.len() == other.data.len()
            && self.data.as_ptr() == other.data.as_ptr()
    }

    /// Check for JPEG SOI/EOI markers
    pub fn is_valid_jpeg(&self) -> bool {
        let data = self.data.as_ref();
        data.len() >= 4 && data[..2] == [0xFF, 0xD8] && data[data.len() - 2..] == [0xFF, 0xD9]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_jpeg() -> Bytes {
        Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9])
    }

    #[test]
    fn test_valid_jpeg_markers() {
        let frame = Frame::video(tiny_jpeg(), Some(Resolution::VGA), 1);
        assert!(frame.is_valid_jpeg());
        assert_eq!(frame.kind, StreamKind::Video);
        assert_eq!(frame.resolution, Some(Resolution::VGA));

        let truncated = Frame::video(Bytes::from_static(&[0xFF, 0xD8, 0x00, 0x00]), None, 2);
        assert!(!truncated.is_valid_jpeg());

        let empty = Frame::video(Bytes::new(), None, 3);
        assert!(!empty.is_valid_jpeg());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_clone_shares_payload() {
        let frame = Frame::audio(Bytes::from(vec![1u8; 4096]), 7);
        let copy = frame.clone();
        assert_eq!(frame.data().as_ptr(), copy.data().as_ptr());
        assert_eq!(copy.sequence, 7);
        assert!(frame.same_publish(&copy));

        // Equal bytes and sequence, separate buffer
        let lookalike = Frame::audio(Bytes::from(vec![1u8; 4096]), 7);
        assert!(!frame.same_publish(&lookalike));

        let mut restamped = frame.clone();
        restamped.sequence = 8;
        assert!(!frame.same_publish(&restamped));
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamKind::Audio.to_string(), "audio");
        assert_eq!(Resolution::HD720.to_string(), "1280x720");
        assert_eq!(Resolution::VGA.pixels(), 307_200);
    }
}
