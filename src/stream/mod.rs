//! Live media fan-out
//!
//! # Components
//!
//! - `FrameBus` - latest video frame and audio chunk
//! - `StreamHub` - producer entry point, fans frames out to sessions
//! - `StreamRegistry` - live sessions per kind
//! - `ClientSession` / `ClientGuard` - one streaming connection and its cleanup
//! - `DeliveryLoop` - drains a session queue into the HTTP response
//! - `MultipartEncoder` - `multipart/x-mixed-replace` wire format

pub mod delivery;
pub mod frame_bus;
pub mod hub;
pub mod multipart;
pub mod registry;
pub mod session;

pub use delivery::{DeliveryLoop, ExitReason};
pub use frame_bus::FrameBus;
pub use hub::{FanOut, StreamHub};
pub use multipart::{MultipartEncoder, AUDIO_BOUNDARY, VIDEO_BOUNDARY};
pub use registry::{SessionKind, StreamRegistry};
pub use session::{
    ClientGuard, ClientId, ClientSession, FpsCalculator, OfferOutcome, SessionState,
};
