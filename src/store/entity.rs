//! String to id compaction for tag names, tag values and metric names
//!
//! Ids are allocated once per distinct string and type, persisted in the
//! entity table and never revoked.

use super::telemetry;
use crate::table::MetricsTable;
use crate::{Error, Result};
use moka::future::Cache;
use std::sync::Arc;
use tracing::{debug, warn};

const NAME_COLUMN: &[u8] = b"n";
const ID_COLUMN: &[u8] = b"i";
const COUNTER_COLUMN: &[u8] = b"c";

/// Kind of string being compacted. Each kind has its own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    TagName,
    TagValue,
    Metric,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::TagName => "tag_name",
            EntityType::TagValue => "tag_value",
            EntityType::Metric => "metric",
        }
    }

    fn code(&self) -> u8 {
        match self {
            EntityType::TagName => b't',
            EntityType::TagValue => b'v',
            EntityType::Metric => b'm',
        }
    }
}

/// Persistent entity id mapping with an in-process cache.
///
/// Concurrent first use of the same string inside the process is coalesced by
/// the cache, so only one caller runs the allocation. Across processes the
/// name row is claimed with a compare-and-set; a loser reads the winner's id
/// back and its own reserved id is skipped.
pub struct EntityTable {
    table: Arc<dyn MetricsTable>,
    ids: Cache<(EntityType, String), u32>,
}

impl EntityTable {
    pub fn new(table: Arc<dyn MetricsTable>, cache_capacity: u64) -> Self {
        Self {
            table,
            ids: Cache::builder().max_capacity(cache_capacity).build(),
        }
    }

    /// Id of `name`, allocating one on first use
    pub async fn resolve(&self, entity_type: EntityType, name: &str) -> Result<u32> {
        self.ids
            .try_get_with(
                (entity_type, name.to_string()),
                self.load_or_allocate(entity_type, name),
            )
            .await
            .map_err(|e| Error::clone(&e))
    }

    /// Id of `name` if one was ever allocated
    pub async fn lookup(&self, entity_type: EntityType, name: &str) -> Result<Option<u32>> {
        let key = (entity_type, name.to_string());
        if let Some(id) = self.ids.get(&key).await {
            return Ok(Some(id));
        }
        let id = self.read_id(entity_type, name).await?;
        if let Some(id) = id {
            self.ids.insert(key, id).await;
        }
        Ok(id)
    }

    /// Reverse lookup of an allocated id
    pub async fn name_of(&self, entity_type: EntityType, id: u32) -> Result<Option<String>> {
        let Some(bytes) = self
            .table
            .get(&reverse_row(entity_type, id), NAME_COLUMN)
            .await?
        else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| Error::Decode(format!("entity {} name: {}", id, e)))
    }

    async fn read_id(&self, entity_type: EntityType, name: &str) -> Result<Option<u32>> {
        self.table
            .get(&name_row(entity_type, name), ID_COLUMN)
            .await?
            .map(|bytes| decode_id(&bytes))
            .transpose()
    }

    async fn load_or_allocate(&self, entity_type: EntityType, name: &str) -> Result<u32> {
        if let Some(id) = self.read_id(entity_type, name).await? {
            return Ok(id);
        }

        let next = self
            .table
            .increment_and_get(&counter_row(entity_type), COUNTER_COLUMN, 1)
            .await?;
        let id = u32::try_from(next).map_err(|_| {
            Error::Internal(format!("{} id space exhausted", entity_type.as_str()))
        })?;

        // A claimed id must always have its reverse row, so write it before
        // claiming and remove it again if the claim is lost.
        self.table
            .put(&reverse_row(entity_type, id), NAME_COLUMN, name.as_bytes().to_vec())
            .await?;

        let row = name_row(entity_type, name);
        let claimed = self
            .table
            .swap(&row, ID_COLUMN, None, Some(id.to_be_bytes().to_vec()))
            .await?;
        if claimed {
            debug!(entity_type = entity_type.as_str(), entity = name, id, "Allocated entity id");
            telemetry::record_entity_allocation(entity_type.as_str());
            return Ok(id);
        }

        telemetry::record_entity_allocation_conflict(entity_type.as_str());
        let reserved = reverse_row(entity_type, id);
        if let Err(e) = self
            .table
            .swap(&reserved, NAME_COLUMN, Some(name.as_bytes()), None)
            .await
        {
            warn!(
                entity_type = entity_type.as_str(),
                entity = name,
                id,
                error = %e,
                "Failed to remove reverse row of unclaimed id"
            );
        }
        match self.table.get(&row, ID_COLUMN).await? {
            Some(bytes) => decode_id(&bytes),
            None => Err(Error::Internal(format!(
                "{} '{}' lost its id claim but no winner is recorded",
                entity_type.as_str(),
                name
            ))),
        }
    }
}

fn name_row(entity_type: EntityType, name: &str) -> Vec<u8> {
    let mut row = Vec::with_capacity(name.len() + 2);
    row.push(b'n');
    row.push(entity_type.code());
    row.extend_from_slice(name.as_bytes());
    row
}

fn reverse_row(entity_type: EntityType, id: u32) -> Vec<u8> {
    let mut row = Vec::with_capacity(6);
    row.push(b'r');
    row.push(entity_type.code());
    row.extend_from_slice(&id.to_be_bytes());
    row
}

fn counter_row(entity_type: EntityType) -> Vec<u8> {
    vec![b'c', entity_type.code()]
}

fn decode_id(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Decode(format!("entity id must be 4 bytes, got {}", bytes.len())))?;
    Ok(u32::from_be_bytes(raw))
}
