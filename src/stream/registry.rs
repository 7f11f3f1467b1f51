//! Registry of live streaming sessions
//!
//! One session list per [`SessionKind`]. Lists are copy-on-write
//! snapshots behind `ArcSwap`: fan-out and status readers load a
//! snapshot without locking, while add/remove build a new list under a
//! writer mutex and swap it in. A slow iteration therefore never blocks
//! a new connection, and a connection arriving mid-iteration is simply
//! not part of that snapshot.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::session::ClientSession;
use crate::error::{AppError, Result};
use crate::events::ClientStats;
use crate::media::StreamKind;

/// Kind of stream a client subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Video,
    Audio,
    /// `/stream`; carries video only for now
    Combined,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [SessionKind::Video, SessionKind::Audio, SessionKind::Combined];

    /// Media actually delivered to this kind of session
    pub fn media(&self) -> StreamKind {
        match self {
            SessionKind::Video | SessionKind::Combined => StreamKind::Video,
            SessionKind::Audio => StreamKind::Audio,
        }
    }

    /// Session kinds that receive frames of `media`
    pub fn subscribers_of(media: StreamKind) -> &'static [SessionKind] {
        match media {
            StreamKind::Video => &[SessionKind::Video, SessionKind::Combined],
            StreamKind::Audio => &[SessionKind::Audio],
        }
    }

    fn index(&self) -> usize {
        match self {
            SessionKind::Video => 0,
            SessionKind::Audio => 1,
            SessionKind::Combined => 2,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Video => write!(f, "video"),
            SessionKind::Audio => write!(f, "audio"),
            SessionKind::Combined => write!(f, "combined"),
        }
    }
}

type SessionList = Vec<Arc<ClientSession>>;

/// Set of active streaming sessions per kind
pub struct StreamRegistry {
    lists: [ArcSwap<SessionList>; 3],
    /// Serializes writers; readers never take it
    write_lock: Mutex<()>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            lists: std::array::from_fn(|_| ArcSwap::from_pointee(Vec::new())),
            write_lock: Mutex::new(()),
        }
    }

    /// Register `session` under `kind`
    ///
    /// A connection id may appear only once across all kinds.
    pub fn add(&self, kind: SessionKind, session: Arc<ClientSession>) -> Result<()> {
        let _w = self.write_lock.lock();

        let conn_id = session.conn_id();
        for other in SessionKind::ALL {
            if self.lists[other.index()]
                .load()
                .iter()
                .any(|s| s.conn_id() == conn_id)
            {
                return Err(AppError::Internal(format!(
                    "connection {} already registered as {}",
                    conn_id, other
                )));
            }
        }

        let slot = &self.lists[kind.index()];
        let mut next: SessionList = (**slot.load()).clone();
        next.push(session);
        slot.store(Arc::new(next));
        Ok(())
    }

    /// Remove the session with `conn_id` from `kind`
    ///
    /// Returns whether it was present.
    pub fn remove(&self, kind: SessionKind, conn_id: u64) -> bool {
        let _w = self.write_lock.lock();

        let slot = &self.lists[kind.index()];
        let current = slot.load();
        if !current.iter().any(|s| s.conn_id() == conn_id) {
            return false;
        }
        let next: SessionList = current
            .iter()
            .filter(|s| s.conn_id() != conn_id)
            .cloned()
            .collect();
        slot.store(Arc::new(next));
        true
    }

    /// Current sessions of `kind` (lock-free snapshot)
    pub fn snapshot(&self, kind: SessionKind) -> Arc<SessionList> {
        self.lists[kind.index()].load_full()
    }

    /// Visit every session of `kind` in a snapshot
    pub fn for_each<F>(&self, kind: SessionKind, mut f: F)
    where
        F: FnMut(&Arc<ClientSession>),
    {
        for session in self.lists[kind.index()].load().iter() {
            f(session);
        }
    }

    /// Number of registered sessions of `kind`
    pub fn count(&self, kind: SessionKind) -> usize {
        self.lists[kind.index()].load().len()
    }

    /// Number of registered sessions of all kinds
    pub fn total(&self) -> usize {
        SessionKind::ALL.iter().map(|k| self.count(*k)).sum()
    }

    /// Find a session by connection id
    pub fn find(&self, conn_id: u64) -> Option<Arc<ClientSession>> {
        SessionKind::ALL.iter().find_map(|kind| {
            self.lists[kind.index()]
                .load()
                .iter()
                .find(|s| s.conn_id() == conn_id)
                .cloned()
        })
    }

    /// Ask one session to terminate
    ///
    /// The session leaves the registry once its delivery loop has
    /// finished cleanup.
    pub fn evict(&self, conn_id: u64) -> bool {
        match self.find(conn_id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Ask every session to terminate; returns how many were signalled
    pub fn evict_all(&self) -> usize {
        let mut count = 0;
        for kind in SessionKind::ALL {
            self.for_each(kind, |session| {
                session.close();
                count += 1;
            });
        }
        count
    }

    /// Per-client statistics of all sessions
    pub fn clients(&self) -> Vec<ClientStats> {
        SessionKind::ALL
            .iter()
            .flat_map(|kind| self.snapshot(*kind).iter().map(|s| s.stats()).collect::<Vec<_>>())
            .collect()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::session::{ClientId, SessionState};
    use std::sync::Barrier;
    use std::thread;
    use tokio_util::sync::CancellationToken;

    fn session(conn_id: u64, kind: SessionKind) -> Arc<ClientSession> {
        let token = CancellationToken::new();
        let id = ClientId {
            conn_id,
            remote: "10.0.0.5:40000".parse().unwrap(),
        };
        let (session, _rx) = ClientSession::new(id, kind, 4, &token);
        session
    }

    #[test]
    fn test_add_remove_count() {
        let registry = StreamRegistry::new();
        registry.add(SessionKind::Video, session(1, SessionKind::Video)).unwrap();
        registry.add(SessionKind::Video, session(2, SessionKind::Video)).unwrap();
        registry.add(SessionKind::Audio, session(3, SessionKind::Audio)).unwrap();

        assert_eq!(registry.count(SessionKind::Video), 2);
        assert_eq!(registry.count(SessionKind::Audio), 1);
        assert_eq!(registry.count(SessionKind::Combined), 0);
        assert_eq!(registry.total(), 3);

        assert!(registry.remove(SessionKind::Video, 1));
        assert!(!registry.remove(SessionKind::Video, 1));
        assert!(!registry.remove(SessionKind::Audio, 2));
        assert_eq!(registry.count(SessionKind::Video), 1);
        assert!(registry.find(2).is_some());
        assert!(registry.find(1).is_none());
    }

    #[test]
    fn test_connection_in_one_kind_only() {
        let registry = StreamRegistry::new();
        registry.add(SessionKind::Video, session(7, SessionKind::Video)).unwrap();
        assert!(registry
            .add(SessionKind::Audio, session(7, SessionKind::Audio))
            .is_err());
        assert!(registry
            .add(SessionKind::Video, session(7, SessionKind::Video))
            .is_err());
        assert_eq!(registry.total(), 1);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutation() {
        let registry = StreamRegistry::new();
        registry.add(SessionKind::Video, session(1, SessionKind::Video)).unwrap();

        let snapshot = registry.snapshot(SessionKind::Video);
        registry.add(SessionKind::Video, session(2, SessionKind::Video)).unwrap();
        registry.remove(SessionKind::Video, 1);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].conn_id(), 1);
        assert_eq!(registry.count(SessionKind::Video), 1);
    }

    #[test]
    fn test_mutation_during_for_each() {
        let registry = StreamRegistry::new();
        for id in 0..5 {
            registry.add(SessionKind::Audio, session(id, SessionKind::Audio)).unwrap();
        }

        let mut visited = 0;
        registry.for_each(SessionKind::Audio, |s| {
            visited += 1;
            registry.remove(SessionKind::Audio, s.conn_id());
            registry
                .add(SessionKind::Audio, session(100 + s.conn_id(), SessionKind::Audio))
                .unwrap();
        });

        assert_eq!(visited, 5);
        assert_eq!(registry.count(SessionKind::Audio), 5);
        assert!(registry.find(0).is_none());
        assert!(registry.find(104).is_some());
    }

    #[test]
    fn test_evict_signals_session() {
        let registry = StreamRegistry::new();
        let s = session(9, SessionKind::Combined);
        s.set_state(SessionState::Streaming);
        registry.add(SessionKind::Combined, s.clone()).unwrap();

        assert!(registry.evict(9));
        assert!(!registry.evict(10));
        assert!(s.cancel_token().is_cancelled());
        assert_eq!(s.state(), SessionState::Closing);
        assert_eq!(registry.evict_all(), 1);
        assert_eq!(registry.clients().len(), 1);
    }

    #[test]
    fn test_concurrent_add_remove_count() {
        let registry = Arc::new(StreamRegistry::new());
        let threads = 8;
        let per_thread = 200u64;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads as u64)
            .map(|t| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_thread {
                        let id = t * 10_000 + i;
                        let kind = if i % 2 == 0 {
                            SessionKind::Video
                        } else {
                            SessionKind::Audio
                        };
                        registry.add(kind, session(id, kind)).unwrap();
                        // Every session this thread added and has not yet
                        // removed is still visible.
                        assert!(registry.find(id).is_some());
                        if i % 4 != 0 {
                            assert!(registry.remove(kind, id));
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // i % 4 == 0 sessions remain, all even so all video
        let expected = threads * (per_thread as usize / 4);
        assert_eq!(registry.count(SessionKind::Video), expected);
        assert_eq!(registry.count(SessionKind::Audio), 0);
        assert_eq!(registry.total(), expected);
    }
}
