//! In-memory table engine for standalone mode and testing

use super::{
    decode_long, encode_long, Columns, DatasetId, MetricsTable, Row, TableProperties, TableStore,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Sorted in-memory table.
///
/// A single `RwLock` over the row map makes every operation atomic. The engine
/// has no native TTL, so expiry relies on the retention scheduler.
#[derive(Debug)]
pub struct InMemoryMetricsTable {
    id: DatasetId,
    properties: TableProperties,
    rows: RwLock<BTreeMap<Vec<u8>, Columns>>,
    unavailable: AtomicBool,
}

impl InMemoryMetricsTable {
    pub fn new(id: DatasetId, properties: TableProperties) -> Self {
        Self {
            id,
            properties,
            rows: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    /// Properties the table was created with
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// Number of rows currently stored
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Simulate the table becoming unreachable (or reachable again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::StorageUnavailable(format!("table {} is unavailable", self.id)));
        }
        Ok(())
    }

    fn bounds<'a>(start: &'a [u8], stop: Option<&'a [u8]>) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
        let upper = match stop {
            Some(stop) => Bound::Excluded(stop),
            None => Bound::Unbounded,
        };
        (Bound::Included(start), upper)
    }

    fn add_to_cell(
        rows: &mut BTreeMap<Vec<u8>, Columns>,
        row: &[u8],
        column: &[u8],
        delta: i64,
    ) -> Result<i64> {
        let columns = rows.entry(row.to_vec()).or_default();
        let current = match columns.get(column) {
            Some(bytes) => decode_long(bytes)?,
            None => 0,
        };
        let updated = current.wrapping_add(delta);
        columns.insert(column.to_vec(), encode_long(updated));
        Ok(updated)
    }
}

#[async_trait]
impl MetricsTable for InMemoryMetricsTable {
    async fn get(&self, row: &[u8], column: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.rows.read().get(row).and_then(|cols| cols.get(column).cloned()))
    }

    async fn put(&self, row: &[u8], column: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_available()?;
        self.rows
            .write()
            .entry(row.to_vec())
            .or_default()
            .insert(column.to_vec(), value);
        Ok(())
    }

    async fn swap(
        &self,
        row: &[u8],
        column: &[u8],
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        self.check_available()?;
        let mut rows = self.rows.write();
        let current = rows.get(row).and_then(|cols| cols.get(column));
        if current.map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                rows.entry(row.to_vec())
                    .or_default()
                    .insert(column.to_vec(), value);
            }
            None => {
                if let Some(cols) = rows.get_mut(row) {
                    cols.remove(column);
                    if cols.is_empty() {
                        rows.remove(row);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn increment(&self, row: &[u8], column: &[u8], delta: i64) -> Result<()> {
        self.check_available()?;
        Self::add_to_cell(&mut self.rows.write(), row, column, delta)?;
        Ok(())
    }

    async fn increment_and_get(&self, row: &[u8], column: &[u8], delta: i64) -> Result<i64> {
        self.check_available()?;
        Self::add_to_cell(&mut self.rows.write(), row, column, delta)
    }

    async fn delete(&self, row: &[u8], columns: &[Vec<u8>]) -> Result<()> {
        self.check_available()?;
        let mut rows = self.rows.write();
        if let Some(cols) = rows.get_mut(row) {
            for column in columns {
                cols.remove(column);
            }
            if cols.is_empty() {
                rows.remove(row);
            }
        }
        Ok(())
    }

    async fn delete_range(&self, start: &[u8], stop: Option<&[u8]>) -> Result<u64> {
        self.check_available()?;
        let mut rows = self.rows.write();
        let doomed: Vec<Vec<u8>> = rows
            .range::<[u8], _>(Self::bounds(start, stop))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            rows.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn scan(&self, start: &[u8], stop: Option<&[u8]>) -> Result<Vec<Row>> {
        self.check_available()?;
        let rows = self.rows.read();
        Ok(rows
            .range::<[u8], _>(Self::bounds(start, stop))
            .map(|(key, columns)| Row {
                key: key.clone(),
                columns: columns.clone(),
            })
            .collect())
    }
}

/// In-memory dataset framework
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    tables: DashMap<DatasetId, Arc<InMemoryMetricsTable>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle on an existing table, for inspection
    pub fn table(&self, id: &DatasetId) -> Option<Arc<InMemoryMetricsTable>> {
        self.tables.get(id).map(|t| Arc::clone(t.value()))
    }

    /// Create a table directly, e.g. to stage a legacy-generation table
    pub fn create_table(&self, id: DatasetId, props: TableProperties) -> Arc<InMemoryMetricsTable> {
        Arc::clone(
            self.tables
                .entry(id.clone())
                .or_insert_with(|| Arc::new(InMemoryMetricsTable::new(id, props)))
                .value(),
        )
    }

    /// Ids of all tables, sorted
    pub fn table_ids(&self) -> Vec<DatasetId> {
        let mut ids: Vec<_> = self.tables.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn get_table(&self, id: &DatasetId) -> Result<Option<Arc<dyn MetricsTable>>> {
        Ok(self
            .tables
            .get(id)
            .map(|t| Arc::clone(t.value()) as Arc<dyn MetricsTable>))
    }

    async fn get_or_create_table(
        &self,
        id: &DatasetId,
        props: &TableProperties,
    ) -> Result<Arc<dyn MetricsTable>> {
        let table = self
            .tables
            .entry(id.clone())
            .or_insert_with(|| {
                info!(
                    table = %id,
                    ttl_secs = ?props.ttl_secs,
                    splits = props.splits.len(),
                    "Creating table"
                );
                Arc::new(InMemoryMetricsTable::new(id.clone(), props.clone()))
            })
            .value()
            .clone();
        Ok(table)
    }

    fn supports_native_ttl(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> InMemoryMetricsTable {
        InMemoryMetricsTable::new(DatasetId::system("t"), TableProperties::default())
    }

    #[tokio::test]
    async fn test_increment_and_get_accumulates() {
        let t = table();
        t.increment(b"r", b"c", 3).await.unwrap();
        assert_eq!(t.increment_and_get(b"r", b"c", 4).await.unwrap(), 7);
        assert_eq!(decode_long(&t.get(b"r", b"c").await.unwrap().unwrap()).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_swap_only_when_expected_matches() {
        let t = table();
        assert!(t.swap(b"r", b"c", None, Some(b"1".to_vec())).await.unwrap());
        assert!(!t.swap(b"r", b"c", None, Some(b"2".to_vec())).await.unwrap());
        assert!(t.swap(b"r", b"c", Some(b"1"), Some(b"2".to_vec())).await.unwrap());
        assert_eq!(t.get(b"r", b"c").await.unwrap(), Some(b"2".to_vec()));
        assert!(t.swap(b"r", b"c", Some(b"2"), None).await.unwrap());
        assert_eq!(t.row_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_and_delete_range_are_half_open() {
        let t = table();
        for key in [b"a", b"b", b"c", b"d"] {
            t.put(key, b"c", vec![1]).await.unwrap();
        }

        let rows = t.scan(b"b", Some(b"d")).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        assert_eq!(t.delete_range(b"a", Some(b"c")).await.unwrap(), 2);
        assert_eq!(t.delete_range(b"a", Some(b"c")).await.unwrap(), 0);
        assert_eq!(t.scan(b"", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_table_fails_every_operation() {
        let t = table();
        t.set_unavailable(true);
        assert!(matches!(t.get(b"r", b"c").await, Err(Error::StorageUnavailable(_))));
        assert!(matches!(t.increment(b"r", b"c", 1).await, Err(Error::StorageUnavailable(_))));
        t.set_unavailable(false);
        assert!(t.increment(b"r", b"c", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_get_or_create_keeps_first_properties() {
        let store = InMemoryTableStore::new();
        let id = DatasetId::system("metrics.v3.table.ts.1");
        assert!(store.get_table(&id).await.unwrap().is_none());

        let props = TableProperties::builder().ttl_secs(10).build();
        store.get_or_create_table(&id, &props).await.unwrap();
        store
            .get_or_create_table(&id, &TableProperties::default())
            .await
            .unwrap();

        assert_eq!(store.table(&id).unwrap().properties().ttl_secs, Some(10));
        assert!(store.get_table(&id).await.unwrap().is_some());
    }
}
