//! Metric value definitions

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Tag name to tag value mapping. Ordered so the entity ids derived from it
/// are always laid out in the same order.
pub type Tags = BTreeMap<String, String>;

/// Metric types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Non-negative delta, summed into the stored aggregate
    Counter,
    /// Absolute value, overwrites the stored value for its bucket
    Gauge,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            MetricType::Counter => 0,
            MetricType::Gauge => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MetricType::Counter),
            1 => Some(MetricType::Gauge),
            _ => None,
        }
    }
}

/// A single measurement.
///
/// The tag set is shared and immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricValue {
    tags: Arc<Tags>,
    name: String,
    timestamp: i64,
    value: i64,
    kind: MetricType,
}

impl MetricValue {
    /// Create a new metric value
    pub fn new<I, K, V>(
        tags: I,
        name: impl Into<String>,
        timestamp: i64,
        value: i64,
        kind: MetricType,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<Tags>();
        Self::with_shared_tags(Arc::new(tags), name, timestamp, value, kind)
    }

    /// Create a value reusing an already shared tag set
    pub fn with_shared_tags(
        tags: Arc<Tags>,
        name: impl Into<String>,
        timestamp: i64,
        value: i64,
        kind: MetricType,
    ) -> Self {
        Self {
            tags,
            name: name.into(),
            timestamp,
            value,
            kind,
        }
    }

    pub fn counter<I, K, V>(tags: I, name: impl Into<String>, timestamp: i64, delta: i64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(tags, name, timestamp, delta, MetricType::Counter)
    }

    pub fn gauge<I, K, V>(tags: I, name: impl Into<String>, timestamp: i64, value: i64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(tags, name, timestamp, value, MetricType::Gauge)
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn shared_tags(&self) -> &Arc<Tags> {
        &self.tags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn kind(&self) -> MetricType {
        self.kind
    }

    /// Check the invariants a value must satisfy before it is stored
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidMetric("metric name is empty".to_string()));
        }
        if self.timestamp < 0 {
            return Err(Error::InvalidMetric(format!(
                "metric {} has negative timestamp {}",
                self.name, self.timestamp
            )));
        }
        if self.kind == MetricType::Counter && self.value < 0 {
            return Err(Error::InvalidMetric(format!(
                "counter {} has negative delta {}",
                self.name, self.value
            )));
        }
        Ok(())
    }
}

/// Time range for queries, in seconds, inclusive at both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

impl From<RangeInclusive<i64>> for TimeRange {
    fn from(range: RangeInclusive<i64>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

/// A stored point: bucket start timestamp and aggregated value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: i64,
    pub value: i64,
}

impl TimePoint {
    pub fn new(timestamp: i64, value: i64) -> Self {
        Self { timestamp, value }
    }
}
