//! Monotonic clock source with skew mitigation
//!
//! Block ages, deletion-mark ages, and upload freshness are all compared
//! against "now". A wall clock stepping backward (NTP adjustment) must never
//! make a block look younger than it was a moment ago, so every age decision
//! goes through this clock.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// A clock source that guarantees monotonically increasing timestamps
/// and a configurable skew margin for age comparisons.
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (millis)
    high_water_ms: AtomicI64,
    /// Maximum tolerated clock skew (millis). Subtracted from computed ages
    /// so a block written by a fast clock is not considered old prematurely.
    max_skew_ms: i64,
}

impl BoundedClock {
    /// Create a new BoundedClock with the given maximum skew tolerance.
    pub fn new(max_skew: Duration) -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
            max_skew_ms: max_skew.as_millis() as i64,
        }
    }

    /// Returns a monotonically increasing millisecond timestamp.
    ///
    /// If the wall clock has gone backward, returns the previous high-water
    /// mark + 1ms instead.
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue, // CAS failed, retry
            }
        }
    }

    /// Returns `chrono::DateTime<Utc>` from the monotonic clock.
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_else(Utc::now)
    }

    /// Skew-adjusted age of an event that happened at `at_millis`.
    ///
    /// Never negative. The skew margin is subtracted so "age >= delay" checks
    /// stay conservative when the event was stamped by a clock running ahead.
    pub fn age_millis(&self, at_millis: i64) -> i64 {
        (self.now_millis() - at_millis - self.max_skew_ms).max(0)
    }

    /// Returns the configured max skew tolerance.
    pub fn max_skew(&self) -> Duration {
        Duration::from_millis(self.max_skew_ms as u64)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        // 30 second default — generous enough for most NTP-synced environments
        Self::new(Duration::from_secs(30))
    }
}
