//! Logical client sessions
//!
//! Distinct from streaming connections: a logical session records that a
//! client (keyed by IP) has been talking to the server recently, in which
//! streaming mode, plus arbitrary metadata. Sessions are refreshed on
//! access and removed by explicit close or by a periodic idle sweep.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{SessionConfig, StreamingMode};
use crate::events::{EventBus, SystemEvent};

/// Snapshot of one logical session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub client_ip: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub streaming_mode: StreamingMode,
    /// Free-form metadata
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

struct Entry {
    data: SessionData,
    /// Monotonic last access, drives expiry
    touched: Instant,
}

impl Entry {
    fn refresh(&mut self) {
        self.touched = Instant::now();
        self.data.last_updated_at = Utc::now();
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.touched) > timeout
    }
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, Arc<Mutex<Entry>>>,
    /// client IP -> session id
    by_ip: HashMap<String, String>,
}

impl Sessions {
    /// Insert a fresh session and make it the one for `client_ip`
    fn insert(&mut self, client_ip: &str, mode: StreamingMode) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let entry = Entry {
            data: SessionData {
                id: id.clone(),
                client_ip: client_ip.to_string(),
                created_at: now,
                last_updated_at: now,
                streaming_mode: mode,
                custom: HashMap::new(),
            },
            touched: Instant::now(),
        };
        self.by_id.insert(id.clone(), Arc::new(Mutex::new(entry)));
        self.by_ip.insert(client_ip.to_string(), id.clone());
        id
    }
}

/// Registry of logical sessions with idle expiry
///
/// Lookups share a read lock; only insertion and removal take the
/// write lock. Refreshing an entry locks that entry alone.
pub struct SessionManager {
    sessions: RwLock<Sessions>,
    timeout: Duration,
    sweep_interval: Duration,
    events: Arc<EventBus>,
    stop: CancellationToken,
}

impl SessionManager {
    pub fn new(config: &SessionConfig, events: Arc<EventBus>) -> Self {
        Self {
            sessions: RwLock::new(Sessions::default()),
            timeout: Duration::from_secs(config.idle_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            events,
            stop: CancellationToken::new(),
        }
    }

    /// Create a session for `client_ip`; returns its id
    pub fn create_session(&self, client_ip: &str, mode: StreamingMode) -> String {
        let mut sessions = self.sessions.write();
        let id = sessions.insert(client_ip, mode);
        drop(sessions);

        debug!(session = %id, client = client_ip, %mode, "Created session");
        id
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<Entry>>> {
        self.sessions.read().by_id.get(id).cloned()
    }

    /// Look up a session and refresh it
    pub fn get_session(&self, id: &str) -> Option<SessionData> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.refresh();
        Some(entry.data.clone())
    }

    /// Modify a session in place; returns `false` if it does not exist
    pub fn update_session<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SessionData),
    {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut entry = entry.lock();
        f(&mut entry.data);
        entry.refresh();
        true
    }

    /// Refresh the session of `client_ip`, creating it on first contact
    pub fn touch_client(&self, client_ip: &str, mode: StreamingMode) -> String {
        let existing = {
            let sessions = self.sessions.read();
            sessions
                .by_ip
                .get(client_ip)
                .and_then(|id| sessions.by_id.get(id).map(|e| (id.clone(), e.clone())))
        };

        if let Some((id, entry)) = existing {
            entry.lock().refresh();
            return id;
        }

        // Another request from the same client may have won the race
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions
            .by_ip
            .get(client_ip)
            .and_then(|id| sessions.by_id.get(id))
        {
            let mut entry = entry.lock();
            entry.refresh();
            return entry.data.id.clone();
        }
        let id = sessions.insert(client_ip, mode);
        drop(sessions);

        debug!(session = %id, client = client_ip, %mode, "Created session");
        id
    }

    /// Remove a session; returns whether it existed
    pub fn close_session(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(entry) = sessions.by_id.remove(id) else {
            return false;
        };
        let client_ip = entry.lock().data.client_ip.clone();
        if sessions.by_ip.get(&client_ip).map(String::as_str) == Some(id) {
            sessions.by_ip.remove(&client_ip);
        }
        drop(sessions);

        debug!(session = id, client = %client_ip, "Closed session");
        true
    }

    /// Snapshot of every live session
    pub fn get_all_sessions(&self) -> Vec<SessionData> {
        let entries: Vec<_> = self.sessions.read().by_id.values().cloned().collect();
        entries.iter().map(|e| e.lock().data.clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().by_id.len()
    }

    /// Remove sessions idle for longer than the timeout
    ///
    /// Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<String> = self
            .sessions
            .read()
            .by_id
            .iter()
            .filter(|(_, e)| e.lock().is_expired(now, self.timeout))
            .map(|(id, _)| id.clone())
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.write();
            for id in candidates {
                // May have been refreshed since the read pass
                let still_expired = sessions
                    .by_id
                    .get(&id)
                    .is_some_and(|e| e.lock().is_expired(now, self.timeout));
                if !still_expired {
                    continue;
                }
                if let Some(entry) = sessions.by_id.remove(&id) {
                    let client_ip = entry.lock().data.client_ip.clone();
                    if sessions.by_ip.get(&client_ip) == Some(&id) {
                        sessions.by_ip.remove(&client_ip);
                    }
                    expired.push((id, client_ip));
                }
            }
        }

        for (session_id, client_ip) in &expired {
            debug!(session = %session_id, client = %client_ip, "Session expired");
            self.events.publish(SystemEvent::SessionExpired {
                session_id: session_id.clone(),
                client_ip: client_ip.clone(),
            });
        }
        expired.len()
    }

    /// Spawn the periodic idle sweep
    ///
    /// Runs until `shutdown` is cancelled or [`SessionManager::shutdown`]
    /// is called.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = manager.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.cleanup_expired();
                        if removed > 0 {
                            info!(removed, remaining = manager.session_count(), "Expired idle sessions");
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    /// Stop the sweeper and drop every session
    pub fn shutdown(&self) {
        self.stop.cancel();
        let mut sessions = self.sessions.write();
        sessions.by_id.clear();
        sessions.by_ip.clear();
    }
}
