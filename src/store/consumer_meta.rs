//! Persisted read progress of the messaging ingestion path

use crate::table::MetricsTable;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const OFFSET_COLUMN: &[u8] = b"o";

/// A partition of a messaging topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    fn row_key(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Last processed offset of a partition, plus opaque consumer metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOffset {
    pub offset: u64,
    #[serde(default)]
    pub metadata: String,
}

impl ConsumerOffset {
    pub fn new(offset: u64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: metadata.into(),
        }
    }
}

/// Consumer offsets, one JSON cell per partition so offset and metadata are
/// always written together.
///
/// Callers save an offset only after every write derived from the messages up
/// to it has been applied.
#[derive(Clone)]
pub struct ConsumerMetaTable {
    table: Arc<dyn MetricsTable>,
}

impl ConsumerMetaTable {
    pub fn new(table: Arc<dyn MetricsTable>) -> Self {
        Self { table }
    }

    pub async fn save_offset(
        &self,
        partition: &TopicPartition,
        offset: u64,
        metadata: &str,
    ) -> Result<()> {
        let cell = serde_json::to_vec(&ConsumerOffset::new(offset, metadata))?;
        self.table.put(&partition.row_key(), OFFSET_COLUMN, cell).await
    }

    pub async fn read(&self, partition: &TopicPartition) -> Result<Option<ConsumerOffset>> {
        self.table
            .get(&partition.row_key(), OFFSET_COLUMN)
            .await?
            .map(|cell| {
                serde_json::from_slice(&cell).map_err(|e| {
                    Error::Decode(format!("consumer offset for {}: {}", partition, e))
                })
            })
            .transpose()
    }

    pub async fn read_offset(&self, partition: &TopicPartition) -> Result<Option<u64>> {
        Ok(self.read(partition).await?.map(|o| o.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{DatasetId, InMemoryMetricsTable, TableProperties};

    fn meta() -> (ConsumerMetaTable, Arc<InMemoryMetricsTable>) {
        let table = Arc::new(InMemoryMetricsTable::new(
            DatasetId::system("metrics.messaging.meta"),
            TableProperties::default(),
        ));
        (ConsumerMetaTable::new(table.clone()), table)
    }

    #[tokio::test]
    async fn test_unknown_partition_has_no_offset() {
        let (meta, _) = meta();
        assert_eq!(meta.read_offset(&TopicPartition::new("metrics0", 0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_and_read_offsets() {
        let (meta, _) = meta();
        let p0 = TopicPartition::new("metrics0", 0);
        let p1 = TopicPartition::new("metrics1", 1);

        meta.save_offset(&p0, 5, "host-a").await.unwrap();
        meta.save_offset(&p0, 9, "host-b").await.unwrap();
        meta.save_offset(&p1, 3, "").await.unwrap();

        assert_eq!(meta.read(&p0).await.unwrap(), Some(ConsumerOffset::new(9, "host-b")));
        assert_eq!(meta.read_offset(&p1).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_corrupt_cell_is_a_decode_error() {
        let (meta, table) = meta();
        let partition = TopicPartition::new("metrics0", 0);
        table
            .put(&partition.row_key(), OFFSET_COLUMN, b"not json".to_vec())
            .await
            .unwrap();
        assert!(matches!(meta.read(&partition).await, Err(Error::Decode(_))));
    }
}
