//! Log throttling
//!
//! Hot paths (per-frame drops, repeated encode failures) would flood the
//! log at frame rate. [`LogThrottler`] lets a message through at most
//! once per interval per key and counts what it suppressed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Keyed log rate limiter
///
/// ```rust
/// use std::time::Duration;
/// use camcast::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("slow_client").is_some());
/// assert!(throttler.should_log("slow_client").is_none());
/// ```
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler letting one message per key through every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a throttler with the interval given in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Decide whether a message for `key` should be logged now
    ///
    /// Returns `Some(suppressed)` with the number of messages swallowed
    /// since the last one that got through, or `None` to stay quiet.
    pub fn should_log(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
                None
            }
            Some(state) => {
                let suppressed = state.suppressed;
                *state = KeyState {
                    last_logged: now,
                    suppressed: 0,
                };
                Some(suppressed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget `key`, so its next message is logged immediately
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}
