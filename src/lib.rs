//! camcast - live camera and microphone fan-out over HTTP
//!
//! A single producer publishes JPEG frames and PCM chunks; any number of
//! HTTP clients pull them as `multipart/x-mixed-replace` streams.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod server;
pub mod sessions;
pub mod state;
pub mod stream;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
pub use server::StreamServer;
