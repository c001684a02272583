//! Opening and creating the physical tables behind the metric store

use super::combined::{choose_backing_table, MetricsFactTable};
use super::consumer_meta::ConsumerMetaTable;
use super::entity::EntityTable;
use super::fact::FactTable;
use crate::config::MetricsConfig;
use crate::schema::Resolution;
use crate::sharding::RowKeyDistributor;
use crate::table::{DatasetId, TableProperties, TableStore};
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

/// Table property recording how many regions a fact table was pre-split into
pub const SPLITS_PROPERTY: &str = "metrics.table.splits";

/// Opens, per resolution, the fact table generation(s) backing the store.
///
/// The legacy-table lookup runs once per resolution; the resulting table is cached
/// for the life of the factory.
pub struct FactTableFactory {
    store: Arc<dyn TableStore>,
    config: MetricsConfig,
    distributor: RowKeyDistributor,
    entities: OnceCell<Arc<EntityTable>>,
    tables: DashMap<Resolution, MetricsFactTable>,
    open_lock: Mutex<()>,
}

impl FactTableFactory {
    pub fn new(store: Arc<dyn TableStore>, config: MetricsConfig) -> Result<Self> {
        config.validate()?;
        let distributor = RowKeyDistributor::new(config.row_key_buckets)?;
        Ok(Self {
            store,
            config,
            distributor,
            entities: OnceCell::new(),
            tables: DashMap::new(),
            open_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Whether the backing store expires data natively
    pub fn supports_native_ttl(&self) -> bool {
        self.store.supports_native_ttl()
    }

    /// The shared entity table, opened on first use
    pub async fn entity_table(&self) -> Result<Arc<EntityTable>> {
        self.entities
            .get_or_try_init(|| async {
                let id = DatasetId::system(&self.config.entity_table);
                let table = self
                    .store
                    .get_or_create_table(&id, &TableProperties::default())
                    .await?;
                info!(table = %id, "Opened entity table");
                Ok::<_, crate::Error>(Arc::new(EntityTable::new(
                    table,
                    self.config.entity_cache_capacity,
                )))
            })
            .await
            .cloned()
    }

    /// Creation properties of the current-generation fact table
    pub fn fact_table_properties(&self, resolution: Resolution) -> TableProperties {
        let mut builder = TableProperties::builder()
            .readless_increment(true)
            .splits(self.distributor.split_keys(self.config.splits))
            .split_policy(self.config.split_policy.clone())
            .add(SPLITS_PROPERTY, self.config.splits);
        if let Some(retention) = self.config.retention_for(resolution) {
            builder = builder.ttl_secs(retention.as_secs());
        }
        builder.build()
    }

    pub async fn get_or_create_fact_table(
        &self,
        resolution: Resolution,
    ) -> Result<MetricsFactTable> {
        if let Some(table) = self.tables.get(&resolution) {
            return Ok(table.clone());
        }

        let _guard = self.open_lock.lock().await;
        if let Some(table) = self.tables.get(&resolution) {
            return Ok(table.clone());
        }

        let entities = self.entity_table().await?;
        let roll_time = self.config.roll_time_for(resolution);

        let legacy_id = DatasetId::system(MetricsConfig::fact_table_name(
            &self.config.legacy_fact_table_prefix,
            resolution,
        ));
        let legacy = self
            .store
            .get_table(&legacy_id)
            .await?
            .map(|table| FactTable::legacy(table, entities.clone(), resolution, roll_time));

        let current_id = DatasetId::system(MetricsConfig::fact_table_name(
            &self.config.fact_table_prefix,
            resolution,
        ));
        let physical = self
            .store
            .get_or_create_table(&current_id, &self.fact_table_properties(resolution))
            .await?;
        let current = FactTable::new(physical, entities, resolution, roll_time, self.distributor);

        let table = choose_backing_table(legacy, current);
        info!(
            resolution = %resolution,
            table = %current_id,
            bridged = table.is_bridged(),
            "Opened fact table"
        );
        self.tables.insert(resolution, table.clone());
        Ok(table)
    }

    pub async fn create_consumer_meta(&self) -> Result<ConsumerMetaTable> {
        let id = DatasetId::system(&self.config.consumer_meta_table);
        let table = self
            .store
            .get_or_create_table(&id, &TableProperties::default())
            .await?;
        Ok(ConsumerMetaTable::new(table))
    }

    /// Create every dataset the metric system uses
    pub async fn setup_datasets(&self) -> Result<()> {
        self.entity_table().await?;
        for resolution in Resolution::ALL {
            self.get_or_create_fact_table(resolution).await?;
        }
        self.create_consumer_meta().await?;
        info!("Metrics datasets are set up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::InMemoryTableStore;
    use std::time::Duration;

    fn factory(store: Arc<InMemoryTableStore>) -> FactTableFactory {
        FactTableFactory::new(store, MetricsConfig::default()).unwrap()
    }

    #[test]
    fn test_properties_skip_ttl_for_total() {
        let factory = factory(Arc::new(InMemoryTableStore::new()));
        let second = factory.fact_table_properties(Resolution::Second);
        assert_eq!(second.ttl_secs, Some(7200));
        assert!(second.readless_increment);
        assert_eq!(second.splits.len(), 15);
        assert_eq!(second.split_policy.as_deref(), Some("DisabledRegionSplitPolicy"));
        assert_eq!(second.extra[SPLITS_PROPERTY], "16");

        let total = factory.fact_table_properties(Resolution::Total);
        assert_eq!(total.ttl_secs, None);
        assert!(total.readless_increment);
    }

    #[test]
    fn test_configured_retention_drives_ttl() {
        let mut config = MetricsConfig::default();
        config.retention.insert(Resolution::Minute, Duration::from_secs(600));
        let factory = FactTableFactory::new(Arc::new(InMemoryTableStore::new()), config).unwrap();
        assert_eq!(factory.fact_table_properties(Resolution::Minute).ttl_secs, Some(600));
    }

    #[test]
    fn test_zero_retention_never_reaches_table_ttl() {
        let mut config = MetricsConfig::default();
        config.retention.insert(Resolution::Second, Duration::ZERO);
        let factory = FactTableFactory::new(Arc::new(InMemoryTableStore::new()), config);
        assert!(matches!(factory, Err(crate::Error::Config(_))));
    }

    #[tokio::test]
    async fn test_fresh_deployment_opens_direct_tables() {
        let store = Arc::new(InMemoryTableStore::new());
        let factory = factory(store.clone());
        let table = factory.get_or_create_fact_table(Resolution::Hour).await.unwrap();
        assert!(!table.is_bridged());
        assert_eq!(table.resolution(), Resolution::Hour);

        let created = store.table(&DatasetId::system("metrics.v3.table.ts.3600")).unwrap();
        assert_eq!(created.properties().ttl_secs, Some(30 * 24 * 3600));
        assert!(store.table(&DatasetId::system("metrics.table.ts.3600")).is_none());
    }

    #[tokio::test]
    async fn test_legacy_table_is_bridged() {
        let store = Arc::new(InMemoryTableStore::new());
        store.create_table(DatasetId::system("metrics.table.ts.60"), TableProperties::default());
        let factory = factory(store);
        assert!(factory.get_or_create_fact_table(Resolution::Minute).await.unwrap().is_bridged());
        assert!(!factory.get_or_create_fact_table(Resolution::Second).await.unwrap().is_bridged());
    }

    #[tokio::test]
    async fn test_decision_is_cached() {
        let store = Arc::new(InMemoryTableStore::new());
        let factory = factory(store.clone());
        assert!(!factory.get_or_create_fact_table(Resolution::Minute).await.unwrap().is_bridged());

        // a legacy table appearing later does not change the opened table
        store.create_table(DatasetId::system("metrics.table.ts.60"), TableProperties::default());
        assert!(!factory.get_or_create_fact_table(Resolution::Minute).await.unwrap().is_bridged());
    }

    #[tokio::test]
    async fn test_setup_datasets_creates_everything() {
        let store = Arc::new(InMemoryTableStore::new());
        factory(store.clone()).setup_datasets().await.unwrap();

        let names: Vec<String> = store.table_ids().into_iter().map(|id| id.name).collect();
        assert_eq!(
            names,
            vec![
                "metrics.entity",
                "metrics.messaging.meta",
                "metrics.v3.table.ts.1",
                "metrics.v3.table.ts.2147483647",
                "metrics.v3.table.ts.3600",
                "metrics.v3.table.ts.60",
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = MetricsConfig {
            row_key_buckets: 0,
            ..MetricsConfig::default()
        };
        assert!(FactTableFactory::new(Arc::new(InMemoryTableStore::new()), config).is_err());
    }
}
