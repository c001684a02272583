//! Bridging between two fact table generations during migration

use super::fact::{sum_series, FactTable};
use crate::schema::{MetricValue, Resolution, Tags, TimePoint, TimeRange};
use crate::Result;

/// View over a legacy and a current fact table for one resolution.
///
/// Writes only ever reach the current table. Reads merge both, and where
/// both hold a value for the same series and bucket the current one wins.
#[derive(Clone)]
pub struct CombinedMetricsTable {
    legacy: FactTable,
    current: FactTable,
}

impl CombinedMetricsTable {
    pub fn new(legacy: FactTable, current: FactTable) -> Self {
        Self { legacy, current }
    }

    pub fn legacy(&self) -> &FactTable {
        &self.legacy
    }

    pub fn current(&self) -> &FactTable {
        &self.current
    }

    pub async fn write(&self, value: &MetricValue) -> Result<()> {
        self.current.write(value).await
    }

    pub async fn write_all(&self, values: &[MetricValue]) -> Result<()> {
        self.current.write_all(values).await
    }

    pub async fn query(
        &self,
        filter: &Tags,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<TimePoint>> {
        let mut merged = self.legacy.series_points(filter, metric, range).await?;
        merged.extend(self.current.series_points(filter, metric, range).await?);
        Ok(sum_series(&merged))
    }

    /// Retention applies to both generations so the legacy residue ages out
    pub async fn delete_before(&self, cutoff: i64) -> Result<u64> {
        let legacy = self.legacy.delete_before(cutoff).await?;
        let current = self.current.delete_before(cutoff).await?;
        Ok(legacy + current)
    }
}

/// Fact table for one resolution as opened by the factory
#[derive(Clone)]
pub enum MetricsFactTable {
    /// No legacy generation exists
    Direct(FactTable),
    /// A legacy generation is still present
    Bridged(CombinedMetricsTable),
}

impl MetricsFactTable {
    pub fn resolution(&self) -> Resolution {
        match self {
            MetricsFactTable::Direct(table) => table.resolution(),
            MetricsFactTable::Bridged(table) => table.current().resolution(),
        }
    }

    pub fn is_bridged(&self) -> bool {
        matches!(self, MetricsFactTable::Bridged(_))
    }

    pub async fn write(&self, value: &MetricValue) -> Result<()> {
        match self {
            MetricsFactTable::Direct(table) => table.write(value).await,
            MetricsFactTable::Bridged(table) => table.write(value).await,
        }
    }

    pub async fn write_all(&self, values: &[MetricValue]) -> Result<()> {
        match self {
            MetricsFactTable::Direct(table) => table.write_all(values).await,
            MetricsFactTable::Bridged(table) => table.write_all(values).await,
        }
    }

    pub async fn query(
        &self,
        filter: &Tags,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<TimePoint>> {
        match self {
            MetricsFactTable::Direct(table) => table.query(filter, metric, range).await,
            MetricsFactTable::Bridged(table) => table.query(filter, metric, range).await,
        }
    }

    pub async fn delete_before(&self, cutoff: i64) -> Result<u64> {
        match self {
            MetricsFactTable::Direct(table) => table.delete_before(cutoff).await,
            MetricsFactTable::Bridged(table) => table.delete_before(cutoff).await,
        }
    }
}

/// Pick the backing table once at open time
pub fn choose_backing_table(legacy: Option<FactTable>, current: FactTable) -> MetricsFactTable {
    match legacy {
        Some(legacy) => MetricsFactTable::Bridged(CombinedMetricsTable::new(legacy, current)),
        None => MetricsFactTable::Direct(current),
    }
}
