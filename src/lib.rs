//! # metricstore
//!
//! Metrics collection and multi-resolution time-series storage.
//!
//! Jobs emit counters and gauges; the collection service aggregates them and
//! persists every value at second, minute, hour and total resolution into
//! sharded fact tables backed by a sorted key-value store.
//!
//! ## Key Features
//!
//! - **Compact row keys**: tag names, tag values and metric names are mapped
//!   to integer ids by the entity table
//! - **Write spreading**: row keys carry a one-byte hash prefix and fact
//!   tables are pre-split on the prefix boundaries
//! - **Online migration**: a legacy table generation stays readable next to
//!   the current one until it ages out
//! - **Retention**: expired buckets are deleted on a schedule when the store
//!   has no native time-to-live
//!
//! ## Architecture
//!
//! - **Store**: entity table, per-resolution fact tables and the factory that
//!   opens them
//! - **Collect**: aggregation layer, collection service lifecycle and the
//!   retention scheduler
//! - **Process**: consumes encoded metric batches from messaging partitions

pub mod clock;
pub mod collect;
pub mod config;
pub mod messaging;
pub mod process;
pub mod schema;
pub mod sharding;
pub mod store;
pub mod table;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::{BoundedClock, Clock, ManualClock};
    pub use crate::collect::{MetricsCollectionService, MetricsContext};
    pub use crate::config::{MessagingConfig, MetricsConfig};
    pub use crate::process::MessagingMetricsProcessorFactory;
    pub use crate::schema::{MetricType, MetricValue, Resolution, Tags, TimePoint, TimeRange};
    pub use crate::store::{FactTableFactory, MetricStore, MetricsFactTable};
    pub use crate::table::{InMemoryTableStore, TableStore};
    pub use crate::{Error, Result};
}
