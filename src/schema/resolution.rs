//! Storage resolutions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bucket granularity at which metric points are aggregated and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    Second,
    Minute,
    Hour,
    /// Unbounded aggregate: a single bucket for all time
    Total,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::Second,
        Resolution::Minute,
        Resolution::Hour,
        Resolution::Total,
    ];

    /// Bucket width in seconds. TOTAL uses `i32::MAX` so every epoch-second
    /// timestamp falls into the bucket starting at 0.
    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::Second => 1,
            Resolution::Minute => 60,
            Resolution::Hour => 3600,
            Resolution::Total => i32::MAX as i64,
        }
    }

    /// Whether data at this resolution is ever eligible for deletion
    pub fn expires(&self) -> bool {
        !matches!(self, Resolution::Total)
    }

    /// Retention applied when nothing is configured
    pub fn default_retention(&self) -> Option<Duration> {
        match self {
            Resolution::Second => Some(Duration::from_secs(2 * 3600)),
            Resolution::Minute | Resolution::Hour => Some(Duration::from_secs(30 * 24 * 3600)),
            Resolution::Total => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Second => "second",
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Total => "total",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
