//! Pluggable encode step
//!
//! The capture collaborator hands over either ready JPEG bytes or a raw
//! frame. Raw frames go through a [`FrameEncoder`] which turns them into
//! a JPEG byte buffer at a given quality.

use bytes::Bytes;
use jpeg_encoder::{ColorType, Encoder};

use super::frame::Resolution;
use crate::error::{AppError, Result};

/// Raw pixel layouts accepted by the encode step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    /// 3 bytes per pixel
    Rgb24,
    /// 4 bytes per pixel
    Rgba32,
    /// 1 byte per pixel (grayscale)
    Luma8,
}

impl RawFormat {
    /// Bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            RawFormat::Rgb24 => 3,
            RawFormat::Rgba32 => 4,
            RawFormat::Luma8 => 1,
        }
    }

    fn color_type(&self) -> ColorType {
        match self {
            RawFormat::Rgb24 => ColorType::Rgb,
            RawFormat::Rgba32 => ColorType::Rgba,
            RawFormat::Luma8 => ColorType::Luma,
        }
    }
}

/// An unencoded frame as produced by capture
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: RawFormat,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: RawFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Expected buffer size for the declared geometry
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Encode step turning raw frames into JPEG bytes
pub trait FrameEncoder: Send {
    /// Encode `raw` with JPEG quality 1-100
    fn encode(&mut self, raw: &RawFrame, quality: u8) -> Result<Bytes>;
}

/// JPEG encoder backed by the `jpeg-encoder` crate
///
/// Keeps its output buffer between calls so steady-state encoding
/// does not reallocate.
#[derive(Default)]
pub struct JpegEncoder {
    buffer: Vec<u8>,
}

impl JpegEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&mut self, raw: &RawFrame, quality: u8) -> Result<Bytes> {
        if raw.width == 0 || raw.height == 0 {
            return Err(AppError::Encode(format!(
                "Invalid dimensions {}x{}",
                raw.width, raw.height
            )));
        }
        if raw.width > u16::MAX as u32 || raw.height > u16::MAX as u32 {
            return Err(AppError::Encode(format!(
                "Dimensions {}x{} exceed JPEG limits",
                raw.width, raw.height
            )));
        }
        if raw.data.len() != raw.expected_len() {
            return Err(AppError::Encode(format!(
                "Buffer size mismatch: got {} bytes, expected {} for {}x{} {:?}",
                raw.data.len(),
                raw.expected_len(),
                raw.width,
                raw.height,
                raw.format
            )));
        }

        self.buffer.clear();
        let encoder = Encoder::new(&mut self.buffer, quality.clamp(1, 100));
        encoder
            .encode(
                &raw.data,
                raw.width as u16,
                raw.height as u16,
                raw.format.color_type(),
            )
            .map_err(|e| AppError::Encode(format!("JPEG encode failed: {}", e)))?;

        Ok(Bytes::copy_from_slice(&self.buffer))
    }
}
