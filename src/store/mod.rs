//! Multi-resolution metric storage
//!
//! Every metric value is written at each [`Resolution`] into that
//! resolution's fact table. Tag and metric strings are compacted to ids by
//! the [`EntityTable`], and row keys are hash-prefixed by the
//! [`RowKeyDistributor`](crate::sharding::RowKeyDistributor).

mod combined;
mod consumer_meta;
mod entity;
mod fact;
mod factory;
pub mod telemetry;

pub use combined::{choose_backing_table, CombinedMetricsTable, MetricsFactTable};
pub use consumer_meta::{ConsumerMetaTable, ConsumerOffset, TopicPartition};
pub use entity::{EntityTable, EntityType};
pub use fact::{FactTable, MAX_ROLL_TIME};
pub use factory::{FactTableFactory, SPLITS_PROPERTY};

use crate::schema::{MetricValue, Resolution, Tags, TimePoint, TimeRange};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Fact tables for all resolutions, opened once and shared by writers and
/// the retention task.
#[derive(Clone)]
pub struct MetricStore {
    tables: Arc<BTreeMap<Resolution, MetricsFactTable>>,
    native_ttl: bool,
}

impl MetricStore {
    pub async fn open(factory: &FactTableFactory) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for resolution in Resolution::ALL {
            tables.insert(resolution, factory.get_or_create_fact_table(resolution).await?);
        }
        Ok(Self {
            tables: Arc::new(tables),
            native_ttl: factory.supports_native_ttl(),
        })
    }

    /// Whether the backing store expires data on its own
    pub fn native_ttl(&self) -> bool {
        self.native_ttl
    }

    pub fn table(&self, resolution: Resolution) -> Result<&MetricsFactTable> {
        self.tables
            .get(&resolution)
            .ok_or_else(|| Error::Internal(format!("no fact table for resolution {}", resolution)))
    }

    /// Write one value at every resolution
    pub async fn add(&self, value: &MetricValue) -> Result<()> {
        value.validate()?;
        for table in self.tables.values() {
            table.write(value).await?;
        }
        Ok(())
    }

    /// Write a batch at every resolution.
    ///
    /// The whole batch is validated before anything is written. A storage
    /// failure is returned as is; values written before it stay written.
    pub async fn add_all(&self, values: &[MetricValue]) -> Result<()> {
        for value in values {
            value.validate()?;
        }
        let started = Instant::now();
        for table in self.tables.values() {
            table.write_all(values).await?;
        }
        telemetry::record_publish(started.elapsed().as_secs_f64(), values.len() as u64);
        Ok(())
    }

    pub async fn query(
        &self,
        resolution: Resolution,
        filter: &Tags,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<TimePoint>> {
        self.table(resolution)?.query(filter, metric, range).await
    }

    pub async fn delete_before(&self, resolution: Resolution, cutoff: i64) -> Result<u64> {
        self.table(resolution)?.delete_before(cutoff).await
    }
}
