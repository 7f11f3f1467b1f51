//! Per-connection streaming sessions
//!
//! A [`ClientSession`] is the shared half of one streaming connection: the
//! producer offers frames into its bounded queue, the registry lists it,
//! and status endpoints read its counters. The queue receiver is owned by
//! the connection's delivery loop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::{SessionKind, StreamRegistry};
use crate::error::Result;
use crate::events::{ClientStats, EventBus, SystemEvent};
use crate::media::Frame;

/// Identity of one streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    /// Server-wide unique connection number
    pub conn_id: u64,
    /// Peer address
    pub remote: SocketAddr,
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.remote, self.conn_id)
    }
}

/// Lifecycle of a streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Streaming = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Streaming,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Result of offering a frame to a client queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Frame queued for delivery
    Queued,
    /// Queue full, frame dropped for this client
    Dropped,
    /// Delivery loop is gone
    Closed,
}

/// Rolling window FPS calculator
#[derive(Debug, Clone)]
pub struct FpsCalculator {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    /// Create a new FPS calculator with 1-second window
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(120),
            window: Duration::from_secs(1),
        }
    }

    /// Record a frame sent
    pub fn record_frame(&mut self) {
        self.record_frame_at(Instant::now());
    }

    fn record_frame_at(&mut self, now: Instant) {
        self.frame_times.push_back(now);
        while let Some(&oldest) = self.frame_times.front() {
            if now.duration_since(oldest) > self.window {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames recorded in the last window
    pub fn current_fps(&self) -> u32 {
        self.frame_times.len() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of one streaming connection
pub struct ClientSession {
    id: ClientId,
    kind: SessionKind,
    state: AtomicU8,
    queue: mpsc::Sender<Frame>,
    capacity: usize,
    /// Cancelled to evict this session; child of the server shutdown token
    cancel: CancellationToken,
    shutdown: CancellationToken,
    connected_at: Instant,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    fps: Mutex<FpsCalculator>,
}

impl ClientSession {
    /// Create a session and the receiving end of its queue
    ///
    /// `capacity` is clamped to at least one frame.
    pub fn new(
        id: ClientId,
        kind: SessionKind,
        capacity: usize,
        shutdown: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let capacity = capacity.max(1);
        let (queue, rx) = mpsc::channel(capacity);
        let session = Arc::new(Self {
            id,
            kind,
            state: AtomicU8::new(SessionState::Connecting as u8),
            queue,
            capacity,
            cancel: shutdown.child_token(),
            shutdown: shutdown.clone(),
            connected_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            fps: Mutex::new(FpsCalculator::new()),
        });
        (session, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn conn_id(&self) -> u64 {
        self.id.conn_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Offer a frame without blocking
    ///
    /// A full queue drops the new frame for this client only.
    pub fn offer(&self, frame: Frame) -> OfferOutcome {
        if self.state() != SessionState::Streaming {
            return OfferOutcome::Closed;
        }
        match self.queue.try_send(frame) {
            Ok(()) => OfferOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                OfferOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => OfferOutcome::Closed,
        }
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames waiting in the queue
    pub fn queued(&self) -> usize {
        self.capacity.saturating_sub(self.queue.capacity())
    }

    /// Ask the delivery loop to terminate
    pub fn close(&self) {
        if self.state() == SessionState::Streaming {
            self.set_state(SessionState::Closing);
        }
        self.cancel.cancel();
    }

    /// Token cancelled on eviction or server shutdown
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the whole server is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.fps.lock().record_frame();
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn connected_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Snapshot of delivery statistics
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            id: self.id.to_string(),
            remote: self.id.remote.to_string(),
            kind: self.kind,
            state: self.state().to_string(),
            fps: self.fps.lock().current_fps(),
            frames_sent: self.frames_sent(),
            frames_dropped: self.frames_dropped(),
            queued: self.queued(),
            connected_secs: self.connected_duration().as_secs(),
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// RAII guard for client lifecycle management
///
/// Registers the session on creation. Cleanup (registry removal,
/// disconnect event, CLOSED state) runs exactly once: on the first
/// `close()` or on drop, whichever comes first, including unwinding.
pub struct ClientGuard {
    session: Arc<ClientSession>,
    registry: Arc<StreamRegistry>,
    events: Arc<EventBus>,
    closed: AtomicBool,
}

impl ClientGuard {
    /// Register `session` and move it to STREAMING
    pub fn register(
        session: Arc<ClientSession>,
        registry: Arc<StreamRegistry>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        // Streaming before the session becomes visible, so the first
        // fan-out after registration is not refused.
        session.set_state(SessionState::Streaming);
        if let Err(e) = registry.add(session.kind(), session.clone()) {
            session.set_state(SessionState::Closed);
            return Err(e);
        }

        let total = registry.count(session.kind());
        info!(
            client = %session.id(),
            kind = %session.kind(),
            total,
            "Client connected"
        );
        events.publish(SystemEvent::ClientConnected {
            client_id: session.id().to_string(),
            kind: session.kind(),
            remote: session.id().remote.to_string(),
            total,
        });

        Ok(Self {
            session,
            registry,
            events,
            closed: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Run cleanup; returns `false` if it already ran
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let session = &self.session;
        session.set_state(SessionState::Closing);
        session.cancel_token().cancel();
        let removed = self.registry.remove(session.kind(), session.conn_id());
        if !removed {
            debug!(client = %session.id(), "Client already absent from registry");
        }
        session.set_state(SessionState::Closed);

        let total = self.registry.count(session.kind());
        let duration_secs = session.connected_duration().as_secs_f32();
        let avg_fps = if duration_secs > 0.1 {
            session.frames_sent() as f32 / duration_secs
        } else {
            0.0
        };
        info!(
            client = %session.id(),
            kind = %session.kind(),
            total,
            "Client disconnected after {:.1}s ({} frames, {} dropped, {:.1} avg FPS)",
            duration_secs,
            session.frames_sent(),
            session.frames_dropped(),
            avg_fps
        );
        self.events.publish(SystemEvent::ClientDisconnected {
            client_id: session.id().to_string(),
            kind: session.kind(),
            frames_sent: session.frames_sent(),
            frames_dropped: session.frames_dropped(),
            total,
        });
        true
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.close();
    }
}
