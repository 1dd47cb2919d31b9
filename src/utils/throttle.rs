//! Log throttling
//!
//! Hardware faults tend to repeat on every poll or request. The throttler
//! lets the first report through and mutes the same key for an interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Limits how often a message with the same key is logged
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Whether `key` may be logged now; records the attempt when it may
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key`, typically once the fault has cleared
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.last_logged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}
