use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::sessions::SessionManager;
use crate::stream::{MultipartEncoder, StreamHub, StreamRegistry};

/// Application-wide state shared across handlers
///
/// # Streaming
///
/// All media flows through `hub`:
/// - `hub.publish_jpeg()` / `hub.publish_raw()` / `hub.publish_audio()` - producer side
/// - `hub.bus()` - latest frames for snapshots
/// - `hub.start()` / `hub.stop()` - stream control
///
/// `registry` lists the live streaming connections; `sessions` tracks
/// logical per-client sessions.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Frame publisher and fan-out
    pub hub: Arc<StreamHub>,
    /// Live streaming connections
    pub registry: Arc<StreamRegistry>,
    /// Logical client sessions
    pub sessions: Arc<SessionManager>,
    /// Event bus for connect/disconnect and state notifications
    pub events: Arc<EventBus>,
    /// Multipart wire encoder, shared by all delivery loops
    pub encoder: MultipartEncoder,
    /// Cancelled on server shutdown; parent of every session token
    pub shutdown: CancellationToken,
    /// Delivery loops, awaited during shutdown
    pub tracker: TaskTracker,
    next_conn_id: AtomicU64,
    started_at: Instant,
}

impl AppState {
    /// Build the state graph from a configuration store
    pub fn new(config: ConfigStore) -> Arc<Self> {
        let cfg = config.get();
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(StreamRegistry::new());
        let hub = Arc::new(StreamHub::new(
            registry.clone(),
            config.clone(),
            events.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(&cfg.session, events.clone()));

        Arc::new(Self {
            encoder: MultipartEncoder::new(cfg.audio),
            config,
            hub,
            registry,
            sessions,
            events,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_conn_id: AtomicU64::new(1),
            started_at: Instant::now(),
        })
    }

    /// Allocate a server-wide unique connection id
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Seconds since the state was created
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
