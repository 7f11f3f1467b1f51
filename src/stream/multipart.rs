//! Multipart wire format
//!
//! Each stream is one unending `multipart/x-mixed-replace` body:
//!
//! ```text
//! --<boundary>\r\n                      <- preamble, sent on connect
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! X-Timestamp: <unix ms>\r\n
//! X-Sequence: <seq>\r\n
//! \r\n
//! <payload>\r\n
//! --<boundary>\r\n                      <- closes this part, opens the next
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::media::{AudioFormat, Frame, StreamKind};

/// Boundary of video (and combined) streams
pub const VIDEO_BOUNDARY: &str = "camcastframe";
/// Boundary of audio streams
pub const AUDIO_BOUNDARY: &str = "camcastaudio";

/// Part headers never exceed this many bytes
const HEADER_RESERVE: usize = 192;

/// Serializes frames into multipart parts
///
/// Stateless apart from the audio MIME type, which is derived from the
/// configured PCM format once.
#[derive(Debug, Clone)]
pub struct MultipartEncoder {
    audio_mime: String,
}

impl MultipartEncoder {
    pub fn new(audio: AudioFormat) -> Self {
        Self {
            audio_mime: audio.mime_type(),
        }
    }

    /// Boundary string for `kind`
    pub fn boundary(kind: StreamKind) -> &'static str {
        match kind {
            StreamKind::Video => VIDEO_BOUNDARY,
            StreamKind::Audio => AUDIO_BOUNDARY,
        }
    }

    /// Response `Content-Type` for a stream of `kind`
    pub fn content_type(kind: StreamKind) -> String {
        format!("multipart/x-mixed-replace; boundary={}", Self::boundary(kind))
    }

    /// Opening delimiter written as soon as the client connects
    pub fn preamble(kind: StreamKind) -> Bytes {
        Bytes::from(format!("--{}\r\n", Self::boundary(kind)))
    }

    /// `Content-Type` of a single part of `kind`
    pub fn part_content_type(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Video => "image/jpeg",
            StreamKind::Audio => &self.audio_mime,
        }
    }

    /// Encode one frame as a complete part
    ///
    /// Returns `None` for an empty payload: degenerate parts are skipped
    /// rather than sent.
    pub fn encode(&self, frame: &Frame) -> Option<Bytes> {
        if frame.is_empty() {
            return None;
        }

        let boundary = Self::boundary(frame.kind);
        let mut buf = BytesMut::with_capacity(HEADER_RESERVE + frame.len());

        buf.put_slice(b"Content-Type: ");
        buf.put_slice(self.part_content_type(frame.kind).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(format!("Content-Length: {}\r\n", frame.len()).as_bytes());
        buf.put_slice(format!("X-Timestamp: {}\r\n", frame.timestamp_millis()).as_bytes());
        buf.put_slice(format!("X-Sequence: {}\r\n", frame.sequence).as_bytes());
        buf.put_slice(b"\r\n");

        buf.put_slice(frame.data());

        buf.put_slice(b"\r\n--");
        buf.put_slice(boundary.as_bytes());
        buf.put_slice(b"\r\n");

        Some(buf.freeze())
    }
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        Self::new(AudioFormat::default())
    }
}
