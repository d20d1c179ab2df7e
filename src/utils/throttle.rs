//! Log throttling utility
//!
//! Limits how often the same message is recorded so a stalled consumer or a
//! run of bad frames does not flood the log.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use livecam::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
///
/// // First call is allowed
/// assert_eq!(throttler.check("queue_full"), Some(0));
///
/// // Repeats within 5 seconds are suppressed and counted
/// assert_eq!(throttler.check("queue_full"), None);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a new log throttler with the specified interval
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a new log throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message for `key` may be logged now
    ///
    /// Returns `Some(n)` when it may, where `n` is the number of messages
    /// suppressed since the previous one; `None` when it should be dropped.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

impl Default for LogThrottler {
    /// Create a default log throttler with 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_throttle_basic() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.check("test").is_some());
        assert!(throttler.check("test").is_none());

        sleep(Duration::from_millis(150));
        assert!(throttler.check("test").is_some());
    }

    #[test]
    fn test_suppressed_count() {
        let throttler = LogThrottler::new(Duration::from_millis(50));
        assert_eq!(throttler.check("drop"), Some(0));
        assert_eq!(throttler.check("drop"), None);
        assert_eq!(throttler.check("drop"), None);

        sleep(Duration::from_millis(80));
        assert_eq!(throttler.check("drop"), Some(2));
    }

    #[test]
    fn test_throttle_different_keys() {
        let throttler = LogThrottler::new(Duration::from_secs(10));

        assert_eq!(throttler.check("key1"), Some(0));
        assert_eq!(throttler.check("key2"), Some(0));
        assert_eq!(throttler.check("key1"), None);
        assert_eq!(throttler.check("key2"), None);
    }
}
