//! Media data model
//!
//! Frames handed over by the capture collaborator, the pluggable
//! encode step, and the audio format descriptor used on the wire.

pub mod audio;
pub mod encoder;
pub mod frame;

pub use audio::AudioFormat;
pub use encoder::{FrameEncoder, JpegEncoder, RawFormat, RawFrame};
pub use frame::{Frame, Resolution, StreamKind};
