//! Event system for connect/disconnect and state notifications
//!
//! Replaces listener callbacks: producers publish onto an explicitly
//! owned [`EventBus`], consumers subscribe to it. The server runs one
//! consumer, [`spawn_event_logger`], which writes every event to the log.

pub mod types;

pub use types::{ClientStats, SystemEvent};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`SystemEvent`]s
///
/// Publishing never blocks. A subscriber that falls more than
/// [`EVENT_CHANNEL_CAPACITY`] events behind misses the oldest ones.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to every current subscriber; dropped if there is none
    pub fn publish(&self, event: SystemEvent) {
        tracing::trace!(event = event.event_name(), "Publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Log every event published from now on until `shutdown` fires
///
/// Events already queued when `shutdown` fires are still logged. The task
/// returns how many events it logged.
pub fn spawn_event_logger(bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<u64> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        log_event(&event);
                        logged += 1;
                    }
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Event logger fell behind"),
                    Err(RecvError::Closed) => return logged,
                },
            }
        }

        while let Ok(event) = rx.try_recv() {
            log_event(&event);
            logged += 1;
        }
        logged
    })
}

fn log_event(event: &SystemEvent) {
    match serde_json::to_string(event) {
        Ok(payload) => debug!(event = event.event_name(), %payload, "Event"),
        Err(e) => warn!(event = event.event_name(), "Unserializable event: {}", e),
    }
}
