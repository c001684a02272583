//! Monotonic clock source with skew mitigation
//!
//! Provides a wall-clock timestamp that never goes backward,
//! and a configurable safety margin for retention decisions. Tests drive
//! time explicitly through [`ManualClock`].

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Time source used by retention and aggregation.
pub trait Clock: Send + Sync {
    /// Current time in seconds since the epoch.
    fn now_secs(&self) -> i64;

    /// Safety margin subtracted from retention cutoffs.
    fn max_skew(&self) -> Duration {
        Duration::ZERO
    }

    /// Cutoff (seconds) below which data older than `retention` may be deleted.
    ///
    /// Shifted earlier by `max_skew`, so a point recorded on a clock running
    /// ahead is never deleted prematurely.
    fn retention_cutoff_secs(&self, retention: Duration) -> i64 {
        self.now_secs() - retention.as_secs() as i64 - self.max_skew().as_secs() as i64
    }
}

/// A clock source that guarantees monotonically increasing timestamps
/// and provides skew-aware operations for retention decisions.
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (nanos)
    high_water_ns: AtomicI64,
    /// Maximum tolerated clock skew (nanos)
    max_skew_ns: i64,
}

impl BoundedClock {
    /// Create a new BoundedClock with the given maximum skew tolerance.
    pub fn new(max_skew: Duration) -> Self {
        Self {
            high_water_ns: AtomicI64::new(0),
            max_skew_ns: max_skew.as_nanos() as i64,
        }
    }

    /// Returns a monotonically increasing nanosecond timestamp.
    ///
    /// If the wall clock has gone backward (e.g. NTP adjustment),
    /// returns the previous high-water mark + 1ns instead.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}

impl Clock for BoundedClock {
    fn now_secs(&self) -> i64 {
        self.now_nanos() / 1_000_000_000
    }

    fn max_skew(&self) -> Duration {
        Duration::from_nanos(self.max_skew_ns as u64)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Manually driven clock for deterministic retention and aggregation tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_secs: AtomicI64,
}

impl ManualClock {
    pub fn new(now_secs: i64) -> Self {
        Self {
            now_secs: AtomicI64::new(now_secs),
        }
    }

    pub fn set(&self, now_secs: i64) {
        self.now_secs.store(now_secs, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_secs
            .fetch_add(by.as_secs() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.now_secs.load(Ordering::Acquire)
    }
}
