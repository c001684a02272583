//! Per-resolution time-series fact table
//!
//! Row key: `[hash prefix] [row time base: u64] [metric id: u32]` followed by
//! `(tag name id, tag value id)` u32 pairs in tag-name order. Each row holds
//! `roll_time` consecutive buckets; the column is the bucket offset within the
//! row as a `u16`.
//! Legacy-generation tables use the same layout without the hash prefix.

use super::entity::{EntityTable, EntityType};
use super::telemetry;
use crate::schema::{MetricType, MetricValue, Resolution, Tags, TimePoint, TimeRange};
use crate::sharding::RowKeyDistributor;
use crate::table::{decode_long, encode_long, MetricsTable, Row};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest number of buckets a row can hold
pub const MAX_ROLL_TIME: u32 = u16::MAX as u32 + 1;

const HEADER_LEN: usize = 12;

/// Stored value per (series tag ids, timestamp), before series are summed
pub(crate) type SeriesPoints = BTreeMap<(Vec<(u32, u32)>, i64), i64>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FactRowKey {
    base: u64,
    metric: u32,
    tags: Vec<(u32, u32)>,
}

impl FactRowKey {
    fn encode(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(HEADER_LEN + self.tags.len() * 8);
        key.extend_from_slice(&self.base.to_be_bytes());
        key.extend_from_slice(&self.metric.to_be_bytes());
        for (name, value) in &self.tags {
            key.extend_from_slice(&name.to_be_bytes());
            key.extend_from_slice(&value.to_be_bytes());
        }
        key
    }

    fn decode(key: &[u8]) -> Result<Self> {
        if key.len() < HEADER_LEN || (key.len() - HEADER_LEN) % 8 != 0 {
            return Err(Error::Decode(format!("malformed fact row key of {} bytes", key.len())));
        }
        let u32_at =
            |at: usize| u32::from_be_bytes([key[at], key[at + 1], key[at + 2], key[at + 3]]);
        let mut base = [0u8; 8];
        base.copy_from_slice(&key[..8]);
        let tags = (HEADER_LEN..key.len())
            .step_by(8)
            .map(|at| (u32_at(at), u32_at(at + 4)))
            .collect();
        Ok(Self {
            base: u64::from_be_bytes(base),
            metric: u32_at(8),
            tags,
        })
    }
}

/// Time-series store for one resolution
#[derive(Clone)]
pub struct FactTable {
    table: Arc<dyn MetricsTable>,
    entities: Arc<EntityTable>,
    resolution: Resolution,
    roll_time: i64,
    distributor: Option<RowKeyDistributor>,
}

impl FactTable {
    /// Current-generation table with hash-prefixed row keys
    pub fn new(
        table: Arc<dyn MetricsTable>,
        entities: Arc<EntityTable>,
        resolution: Resolution,
        roll_time: u32,
        distributor: RowKeyDistributor,
    ) -> Self {
        Self::build(table, entities, resolution, roll_time, Some(distributor))
    }

    /// Legacy-generation table with unsalted row keys
    pub fn legacy(
        table: Arc<dyn MetricsTable>,
        entities: Arc<EntityTable>,
        resolution: Resolution,
        roll_time: u32,
    ) -> Self {
        Self::build(table, entities, resolution, roll_time, None)
    }

    fn build(
        table: Arc<dyn MetricsTable>,
        entities: Arc<EntityTable>,
        resolution: Resolution,
        roll_time: u32,
        distributor: Option<RowKeyDistributor>,
    ) -> Self {
        // A single bucket covers all time at TOTAL
        let roll_time = match resolution {
            Resolution::Total => 1,
            _ => roll_time.clamp(1, MAX_ROLL_TIME),
        };
        Self {
            table,
            entities,
            resolution,
            roll_time: roll_time as i64,
            distributor,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn is_legacy(&self) -> bool {
        self.distributor.is_none()
    }

    /// Apply one value: counters are incremented without a read, gauges
    /// overwrite their bucket.
    pub async fn write(&self, value: &MetricValue) -> Result<()> {
        let result = self.write_inner(value).await;
        match &result {
            Ok(()) => telemetry::record_fact_write(self.resolution.as_str(), value.kind().as_str()),
            Err(_) => telemetry::record_fact_write_failure(self.resolution.as_str()),
        }
        result
    }

    async fn write_inner(&self, value: &MetricValue) -> Result<()> {
        value.validate()?;

        let metric = self.entities.resolve(EntityType::Metric, value.name()).await?;
        let mut tags = Vec::with_capacity(value.tags().len());
        for (name, tag_value) in value.tags() {
            tags.push((
                self.entities.resolve(EntityType::TagName, name).await?,
                self.entities.resolve(EntityType::TagValue, tag_value).await?,
            ));
        }

        let (base, offset) = self.locate(value.timestamp());
        let row = self.physical_key(&FactRowKey { base, metric, tags }.encode());
        let column = offset.to_be_bytes();

        match value.kind() {
            MetricType::Counter => self.table.increment(&row, &column, value.value()).await,
            MetricType::Gauge => self.table.put(&row, &column, encode_long(value.value())).await,
        }
    }

    /// Write a batch in order, stopping at the first failure
    pub async fn write_all(&self, values: &[MetricValue]) -> Result<()> {
        for value in values {
            self.write(value).await?;
        }
        Ok(())
    }

    /// Points of `metric` for every series matching `filter`, summed per
    /// bucket, ascending. A series matches when its tags contain all filter
    /// pairs. TOTAL ignores `range`.
    pub async fn query(
        &self,
        filter: &Tags,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<TimePoint>> {
        let series = self.series_points(filter, metric, range).await?;
        Ok(sum_series(&series))
    }

    pub(crate) async fn series_points(
        &self,
        filter: &Tags,
        metric: &str,
        range: TimeRange,
    ) -> Result<SeriesPoints> {
        let mut points = SeriesPoints::new();

        let Some(metric) = self.entities.lookup(EntityType::Metric, metric).await? else {
            return Ok(points);
        };
        let mut wanted = Vec::with_capacity(filter.len());
        for (name, value) in filter {
            let name = self.entities.lookup(EntityType::TagName, name).await?;
            let value = self.entities.lookup(EntityType::TagValue, value).await?;
            match (name, value) {
                (Some(name), Some(value)) => wanted.push((name, value)),
                // never written, nothing can match
                _ => return Ok(points),
            }
        }

        let (start, stop) = match self.resolution {
            Resolution::Total => (0u64, None),
            _ if range.end < range.start || range.end < 0 => return Ok(points),
            _ => {
                let (first, _) = self.locate(range.start.max(0));
                let (last, _) = self.locate(range.end);
                let row_span = (self.roll_time * self.resolution.seconds()) as u64;
                (first, last.checked_add(row_span))
            }
        };

        let width = self.resolution.seconds();
        for row in self.scan(&start.to_be_bytes(), stop.map(|s| s.to_be_bytes())).await? {
            let key = FactRowKey::decode(self.logical_key(&row.key))?;
            if key.metric != metric || !wanted.iter().all(|pair| key.tags.contains(pair)) {
                continue;
            }
            for (column, cell) in &row.columns {
                let offset = decode_offset(column)?;
                let timestamp = key.base as i64 + offset as i64 * width;
                if self.resolution != Resolution::Total && !range.contains(timestamp) {
                    continue;
                }
                points.insert((key.tags.clone(), timestamp), decode_long(cell)?);
            }
        }
        Ok(points)
    }

    /// Remove every bucket that ends at or before `cutoff`. Returns the number
    /// of rows removed or trimmed; re-running with the same cutoff returns 0.
    pub async fn delete_before(&self, cutoff: i64) -> Result<u64> {
        if !self.resolution.expires() {
            return Ok(0);
        }
        let width = self.resolution.seconds();
        let cutoff_bucket = cutoff.div_euclid(width);
        if cutoff_bucket <= 0 {
            return Ok(0);
        }
        let first_kept_offset = cutoff_bucket.rem_euclid(self.roll_time);
        let boundary_base = ((cutoff_bucket - first_kept_offset) * width) as u64;

        let mut removed = 0;
        let zero = 0u64.to_be_bytes();
        let boundary = boundary_base.to_be_bytes();
        for (start, stop) in self.ranges(&zero, Some(&boundary)) {
            removed += self.table.delete_range(&start, stop.as_deref()).await?;
        }

        // Older buckets of the row holding the cutoff
        if first_kept_offset > 0 {
            let next = (boundary_base + 1).to_be_bytes();
            for row in self.scan(&boundary, Some(next)).await? {
                let mut doomed = Vec::new();
                for column in row.columns.keys() {
                    if (decode_offset(column)? as i64) < first_kept_offset {
                        doomed.push(column.clone());
                    }
                }
                if !doomed.is_empty() {
                    self.table.delete(&row.key, &doomed).await?;
                    removed += 1;
                }
            }
        }

        debug!(
            resolution = %self.resolution,
            legacy = self.is_legacy(),
            cutoff,
            removed,
            "Deleted expired fact rows"
        );
        Ok(removed)
    }

    /// Row time base and column offset for a timestamp
    fn locate(&self, timestamp: i64) -> (u64, u16) {
        // TOTAL has one bucket regardless of timestamp
        if self.resolution == Resolution::Total {
            return (0, 0);
        }
        let width = self.resolution.seconds();
        let bucket = timestamp.div_euclid(width);
        let offset = bucket.rem_euclid(self.roll_time);
        (((bucket - offset) * width) as u64, offset as u16)
    }

    fn physical_key(&self, logical: &[u8]) -> Vec<u8> {
        match &self.distributor {
            Some(distributor) => distributor.distribute(logical),
            None => logical.to_vec(),
        }
    }

    fn logical_key<'a>(&self, physical: &'a [u8]) -> &'a [u8] {
        match &self.distributor {
            Some(distributor) => distributor.original_key(physical),
            None => physical,
        }
    }

    fn ranges(&self, start: &[u8], stop: Option<&[u8]>) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        match &self.distributor {
            Some(distributor) => distributor.distributed_ranges(start, stop),
            None => vec![(start.to_vec(), stop.map(<[u8]>::to_vec))],
        }
    }

    async fn scan(&self, start: &[u8], stop: Option<[u8; 8]>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for (lower, upper) in self.ranges(start, stop.as_ref().map(|s| s.as_slice())) {
            rows.extend(self.table.scan(&lower, upper.as_deref()).await?);
        }
        Ok(rows)
    }
}

/// Sum series per timestamp, ascending
pub(crate) fn sum_series(series: &SeriesPoints) -> Vec<TimePoint> {
    let mut totals: BTreeMap<i64, i64> = BTreeMap::new();
    for ((_, timestamp), value) in series {
        *totals.entry(*timestamp).or_default() += value;
    }
    totals
        .into_iter()
        .map(|(timestamp, value)| TimePoint::new(timestamp, value))
        .collect()
}

fn decode_offset(column: &[u8]) -> Result<u16> {
    let raw: [u8; 2] = column.try_into().map_err(|_| {
        warn!(len = column.len(), "Unexpected fact column qualifier");
        Error::Decode(format!("fact column must be 2 bytes, got {}", column.len()))
    })?;
    Ok(u16::from_be_bytes(raw))
}
