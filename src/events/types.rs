//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::config::QualityTier;
use crate::stream::SessionKind;

/// Per-client delivery statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    /// Client ID
    pub id: String,
    /// Remote address
    pub remote: String,
    /// Stream the client is subscribed to
    pub kind: SessionKind,
    /// Lifecycle state
    pub state: String,
    /// Current FPS for this client (frames sent in last second)
    pub fps: u32,
    /// Frames written to the client
    pub frames_sent: u64,
    /// Frames dropped because the client queue was full
    pub frames_dropped: u64,
    /// Frames currently waiting in the client queue
    pub queued: usize,
    /// Connected duration (seconds)
    pub connected_secs: u64,
}

/// System event enumeration
///
/// Serialized as `{ "event": "<name>", "data": { ... } }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// A streaming client was registered
    #[serde(rename = "stream.client_connected")]
    ClientConnected {
        client_id: String,
        kind: SessionKind,
        remote: String,
        /// Live clients of this kind after the change
        total: usize,
    },

    /// A streaming client finished cleanup
    #[serde(rename = "stream.client_disconnected")]
    ClientDisconnected {
        client_id: String,
        kind: SessionKind,
        frames_sent: u64,
        frames_dropped: u64,
        /// Live clients of this kind after the change
        total: usize,
    },

    /// Producer side started or stopped accepting frames
    #[serde(rename = "stream.state_changed")]
    StreamStateChanged { streaming: bool },

    /// Encode quality tier changed
    #[serde(rename = "stream.quality_changed")]
    QualityChanged { quality: QualityTier },

    /// A logical session was removed by the idle sweep
    #[serde(rename = "session.expired")]
    SessionExpired {
        session_id: String,
        client_ip: String,
    },
}

impl SystemEvent {
    /// Dotted event name, e.g. `stream.client_connected`
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ClientConnected { .. } => "stream.client_connected",
            Self::ClientDisconnected { .. } => "stream.client_disconnected",
            Self::StreamStateChanged { .. } => "stream.state_changed",
            Self::QualityChanged { .. } => "stream.quality_changed",
            Self::SessionExpired { .. } => "session.expired",
        }
    }
}
