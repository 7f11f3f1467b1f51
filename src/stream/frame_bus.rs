//! Latest-frame slots
//!
//! The bus keeps exactly one current video frame and one current audio
//! chunk. There is no history: publishing replaces the slot with a single
//! pointer swap, so a reader observes either nothing or a complete frame.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::media::{Frame, StreamKind};

/// Holder of the most recent frame per stream kind
pub struct FrameBus {
    video: ArcSwap<Option<Frame>>,
    audio: ArcSwap<Option<Frame>>,
    /// Number of publishes per slot, for version-change polling
    video_version: AtomicU64,
    audio_version: AtomicU64,
}

impl FrameBus {
    pub fn new() -> Self {
        Self {
            video: ArcSwap::from_pointee(None),
            audio: ArcSwap::from_pointee(None),
            video_version: AtomicU64::new(0),
            audio_version: AtomicU64::new(0),
        }
    }

    /// Replace the current video frame
    pub fn update_frame(&self, frame: Frame) -> Result<()> {
        if frame.kind != StreamKind::Video {
            return Err(AppError::InvalidFrame(format!(
                "{} frame published to the video slot",
                frame.kind
            )));
        }
        self.video.store(Arc::new(Some(frame)));
        self.video_version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Replace the current audio chunk
    pub fn update_audio(&self, frame: Frame) -> Result<()> {
        if frame.kind != StreamKind::Audio {
            return Err(AppError::InvalidFrame(format!(
                "{} frame published to the audio slot",
                frame.kind
            )));
        }
        self.audio.store(Arc::new(Some(frame)));
        self.audio_version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Publish into the slot matching the frame's kind
    pub fn update(&self, frame: Frame) -> Result<()> {
        match frame.kind {
            StreamKind::Video => self.update_frame(frame),
            StreamKind::Audio => self.update_audio(frame),
        }
    }

    /// Latest video frame, if any was published
    pub fn current_frame(&self) -> Option<Frame> {
        (**self.video.load()).clone()
    }

    /// Latest audio chunk, if any was published
    pub fn current_audio(&self) -> Option<Frame> {
        (**self.audio.load()).clone()
    }

    /// Latest frame of `kind`
    pub fn current(&self, kind: StreamKind) -> Option<Frame> {
        match kind {
            StreamKind::Video => self.current_frame(),
            StreamKind::Audio => self.current_audio(),
        }
    }

    /// Publish count of the slot for `kind`
    pub fn version(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Video => self.video_version.load(Ordering::Acquire),
            StreamKind::Audio => self.audio_version.load(Ordering::Acquire),
        }
    }

    /// Empty both slots
    pub fn clear(&self) {
        self.video.store(Arc::new(None));
        self.audio.store(Arc::new(None));
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}
