//! Data model for metricstore
//!
//! Metric values are tagged numeric measurements. Every value is stored at
//! each [`Resolution`], bucketed by that resolution's width.

mod metrics;
mod resolution;

pub use metrics::{MetricType, MetricValue, Tags, TimePoint, TimeRange};
pub use resolution::Resolution;
