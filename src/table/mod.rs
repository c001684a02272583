//! Backing key-value table abstraction
//!
//! Fact, entity and consumer-offset data all live in sorted key-value tables
//! addressed by (row, column). The physical engine is a collaborator; this
//! module defines the contract metricstore relies on and an in-memory engine
//! for standalone deployments and tests.

mod memory;

pub use memory::{InMemoryMetricsTable, InMemoryTableStore};

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Namespace reserved for platform tables, distinct from user namespaces
pub const SYSTEM_NAMESPACE: &str = "system";

/// Column qualifier to cell value
pub type Columns = BTreeMap<Vec<u8>, Vec<u8>>;

/// A scanned row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub columns: Columns,
}

/// Identifier of a physical table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId {
    pub namespace: String,
    pub name: String,
}

impl DatasetId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// A table in the system namespace
    pub fn system(name: impl Into<String>) -> Self {
        Self::new(SYSTEM_NAMESPACE, name)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Creation-time properties of a physical table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Native time-to-live in seconds (only honoured by engines with TTL support)
    pub ttl_secs: Option<u64>,
    /// Counter columns are incremented without a prior read
    pub readless_increment: bool,
    /// Pre-split region boundaries
    pub splits: Vec<Vec<u8>>,
    /// Region split policy; pre-split tables disable automatic splitting
    pub split_policy: Option<String>,
    /// Engine-specific extras
    pub extra: BTreeMap<String, String>,
}

impl TableProperties {
    pub fn builder() -> TablePropertiesBuilder {
        TablePropertiesBuilder::default()
    }
}

/// Builder for [`TableProperties`]
#[derive(Debug, Default)]
pub struct TablePropertiesBuilder {
    props: TableProperties,
}

impl TablePropertiesBuilder {
    pub fn ttl_secs(mut self, ttl: u64) -> Self {
        self.props.ttl_secs = Some(ttl);
        self
    }

    pub fn readless_increment(mut self, enabled: bool) -> Self {
        self.props.readless_increment = enabled;
        self
    }

    pub fn splits(mut self, splits: Vec<Vec<u8>>) -> Self {
        self.props.splits = splits;
        self
    }

    pub fn split_policy(mut self, policy: impl Into<String>) -> Self {
        self.props.split_policy = Some(policy.into());
        self
    }

    pub fn add(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.props.extra.insert(key.into(), value.to_string());
        self
    }

    pub fn build(self) -> TableProperties {
        self.props
    }
}

/// Row/column table operations.
///
/// Every call is a single atomic operation against the table; there is no
/// transaction spanning calls.
#[async_trait]
pub trait MetricsTable: Send + Sync {
    /// Read a single cell
    async fn get(&self, row: &[u8], column: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Overwrite a single cell
    async fn put(&self, row: &[u8], column: &[u8], value: Vec<u8>) -> Result<()>;

    /// Compare-and-set a cell. `expected = None` means the cell must be absent;
    /// `new = None` deletes it. Returns whether the swap happened.
    async fn swap(
        &self,
        row: &[u8],
        column: &[u8],
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool>;

    /// Add `delta` to an 8-byte counter cell without returning it
    async fn increment(&self, row: &[u8], column: &[u8], delta: i64) -> Result<()>;

    /// Add `delta` to an 8-byte counter cell and return the new value
    async fn increment_and_get(&self, row: &[u8], column: &[u8], delta: i64) -> Result<i64>;

    /// Delete the given columns of a row
    async fn delete(&self, row: &[u8], columns: &[Vec<u8>]) -> Result<()>;

    /// Delete all rows in `[start, stop)`; `stop = None` means unbounded.
    /// Returns the number of rows removed.
    async fn delete_range(&self, start: &[u8], stop: Option<&[u8]>) -> Result<u64>;

    /// Scan rows in `[start, stop)` in key order
    async fn scan(&self, start: &[u8], stop: Option<&[u8]>) -> Result<Vec<Row>>;
}

/// Dataset framework: opens physical tables by id.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Open an existing table without creating it
    async fn get_table(&self, id: &DatasetId) -> Result<Option<Arc<dyn MetricsTable>>>;

    /// Open a table, creating it with `props` if it does not exist
    async fn get_or_create_table(
        &self,
        id: &DatasetId,
        props: &TableProperties,
    ) -> Result<Arc<dyn MetricsTable>>;

    /// Whether the engine expires cells on its own according to `ttl_secs`
    fn supports_native_ttl(&self) -> bool;
}

/// Encode a counter/gauge cell
pub fn encode_long(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decode a counter/gauge cell
pub fn decode_long(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        crate::Error::Serialization(format!("expected 8-byte long, got {} bytes", bytes.len()))
    })?;
    Ok(i64::from_be_bytes(raw))
}
