//! Capture clock
//!
//! Timestamps handed out here never go backwards, even if the wall clock
//! is adjusted, and are truncated to the microsecond precision the queue
//! stores.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

type TimeSource = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct CaptureClock {
    source: TimeSource,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl CaptureClock {
    /// Clock backed by the system time
    pub fn system() -> Self {
        Self::with_source(Utc::now)
    }

    pub fn with_source<F>(source: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        Self {
            source: Box::new(source),
            last: Mutex::new(None),
        }
    }

    /// Next capture timestamp
    pub fn now(&self) -> DateTime<Utc> {
        let raw = (self.source)();
        let now = DateTime::from_timestamp_micros(raw.timestamp_micros()).unwrap_or(raw);

        let mut last = self.last.lock();
        let stamped = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamped);
        stamped
    }
}

impl Default for CaptureClock {
    fn default() -> Self {
        Self::system()
    }
}
