//! Metrics system configuration and component factory
//!
//! Defaults mirror a standalone deployment. `MetricsConfig::from_env` overlays
//! `METRICS_*` environment variables; `ComponentFactory` selects the backing
//! table store and message bus from `TABLE_BACKEND` / `MESSAGING_BACKEND`.

use crate::messaging::{InMemoryMessagingService, MessagingService, TopicId};
use crate::schema::Resolution;
use crate::sharding::MAX_BUCKETS;
use crate::store::MAX_ROLL_TIME;
use crate::table::{InMemoryTableStore, TableStore};
use crate::{Error, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Split policy set on pre-split fact tables so the engine never re-splits them
pub const DISABLED_SPLIT_POLICY: &str = "DisabledRegionSplitPolicy";

/// Metrics storage and collection configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Entity (string to id) table name
    pub entity_table: String,
    /// Current-generation fact table prefix; tables are `<prefix>.ts.<seconds>`
    pub fact_table_prefix: String,
    /// Legacy-generation fact table prefix checked for migration
    pub legacy_fact_table_prefix: String,
    /// Messaging consumer offsets table name
    pub consumer_meta_table: String,
    /// Retention per resolution; TOTAL never expires
    pub retention: HashMap<Resolution, Duration>,
    /// Buckets per row when no per-resolution override exists
    pub default_roll_time: u32,
    /// Per-resolution roll time overrides
    pub roll_time: HashMap<Resolution, u32>,
    /// Number of hash-prefix buckets for row keys
    pub row_key_buckets: usize,
    /// Number of regions fact tables are pre-split into
    pub splits: usize,
    pub split_policy: String,
    /// How often the aggregation layer publishes its buffered values
    pub flush_interval: Duration,
    /// Delay before the first retention run
    pub retention_initial_delay: Duration,
    /// Period between retention runs
    pub retention_interval: Duration,
    /// Entity ids kept in the in-process cache
    pub entity_cache_capacity: u64,
    /// Messaging ingestion; `None` disables the processor
    pub messaging: Option<MessagingConfig>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let retention = Resolution::ALL
            .iter()
            .filter_map(|res| res.default_retention().map(|window| (*res, window)))
            .collect();
        Self {
            entity_table: "metrics.entity".to_string(),
            fact_table_prefix: "metrics.v3.table".to_string(),
            legacy_fact_table_prefix: "metrics.table".to_string(),
            consumer_meta_table: "metrics.messaging.meta".to_string(),
            retention,
            default_roll_time: 3600,
            roll_time: HashMap::new(),
            row_key_buckets: 16,
            splits: 16,
            split_policy: DISABLED_SPLIT_POLICY.to_string(),
            flush_interval: Duration::from_secs(1),
            retention_initial_delay: Duration::from_secs(1),
            retention_interval: Duration::from_secs(3600),
            entity_cache_capacity: 100_000,
            messaging: None,
        }
    }
}

impl MetricsConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - METRICS_RETENTION_SECOND_SECS / _MINUTE_SECS / _HOUR_SECS
    /// - METRICS_ROLL_TIME, METRICS_ROLL_TIME_<RESOLUTION>
    /// - METRICS_ROW_KEY_BUCKETS, METRICS_SPLITS
    /// - METRICS_FLUSH_INTERVAL_SECS, METRICS_RETENTION_INTERVAL_SECS
    /// - METRICS_ENTITY_CACHE_CAPACITY, METRICS_TABLE_PREFIX
    /// - METRICS_MESSAGING_PARTITIONS (enables the messaging processor),
    ///   METRICS_MESSAGING_TOPIC_PREFIX
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        for res in [Resolution::Second, Resolution::Minute, Resolution::Hour] {
            let name = format!("METRICS_RETENTION_{}_SECS", res.as_str().to_ascii_uppercase());
            if let Some(secs) = parse_var::<u64>(&lookup, &name)? {
                config.retention.insert(res, Duration::from_secs(secs));
            }
            let name = format!("METRICS_ROLL_TIME_{}", res.as_str().to_ascii_uppercase());
            if let Some(roll) = parse_var::<u32>(&lookup, &name)? {
                config.roll_time.insert(res, roll);
            }
        }
        if let Some(roll) = parse_var(&lookup, "METRICS_ROLL_TIME")? {
            config.default_roll_time = roll;
        }
        if let Some(buckets) = parse_var(&lookup, "METRICS_ROW_KEY_BUCKETS")? {
            config.row_key_buckets = buckets;
        }
        if let Some(splits) = parse_var(&lookup, "METRICS_SPLITS")? {
            config.splits = splits;
        }
        if let Some(secs) = parse_var(&lookup, "METRICS_FLUSH_INTERVAL_SECS")? {
            config.flush_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "METRICS_RETENTION_INTERVAL_SECS")? {
            config.retention_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_var(&lookup, "METRICS_ENTITY_CACHE_CAPACITY")? {
            config.entity_cache_capacity = capacity;
        }
        if let Some(prefix) = lookup("METRICS_TABLE_PREFIX").filter(|p| !p.trim().is_empty()) {
            config.fact_table_prefix = prefix.trim().to_string();
        }
        if let Some(partitions) = parse_var(&lookup, "METRICS_MESSAGING_PARTITIONS")? {
            let mut messaging = MessagingConfig {
                partitions,
                ..MessagingConfig::default()
            };
            if let Some(prefix) = lookup("METRICS_MESSAGING_TOPIC_PREFIX") {
                messaging.topic_prefix = prefix.trim().to_string();
            }
            config.messaging = Some(messaging);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.row_key_buckets == 0 || self.row_key_buckets > MAX_BUCKETS {
            return Err(Error::Config(format!(
                "row_key_buckets must be in 1..={}, got {}",
                MAX_BUCKETS, self.row_key_buckets
            )));
        }
        if self.splits == 0 {
            return Err(Error::Config("splits must be at least 1".to_string()));
        }
        for res in Resolution::ALL {
            let roll = self.roll_time_for(res);
            if roll == 0 || roll > MAX_ROLL_TIME {
                return Err(Error::Config(format!(
                    "roll time for {} must be in 1..={}, got {}",
                    res, MAX_ROLL_TIME, roll
                )));
            }
        }
        for (res, window) in &self.retention {
            if res.expires() && window.as_secs() == 0 {
                return Err(Error::Config(format!(
                    "retention for {} must be at least one second",
                    res
                )));
            }
        }
        if self.flush_interval.is_zero() || self.retention_interval.is_zero() {
            return Err(Error::Config(
                "flush and retention intervals must be non-zero".to_string(),
            ));
        }
        if let Some(messaging) = &self.messaging {
            messaging.validate()?;
        }
        Ok(())
    }

    /// Retention window, `None` when the resolution is kept forever
    pub fn retention_for(&self, resolution: Resolution) -> Option<Duration> {
        if !resolution.expires() {
            return None;
        }
        self.retention.get(&resolution).copied()
    }

    pub fn roll_time_for(&self, resolution: Resolution) -> u32 {
        match resolution {
            Resolution::Total => 1,
            _ => self
                .roll_time
                .get(&resolution)
                .copied()
                .unwrap_or(self.default_roll_time),
        }
    }

    /// Physical name of a fact table under `prefix`
    pub fn fact_table_name(prefix: &str, resolution: Resolution) -> String {
        format!("{}.ts.{}", prefix, resolution.seconds())
    }
}

/// Messaging ingestion configuration
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Partition topics are named `<prefix><partition>`
    pub topic_prefix: String,
    pub partitions: u32,
    /// Messages fetched per poll
    pub fetch_limit: usize,
    /// Wait between polls of an idle or failing partition
    pub poll_interval: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "metrics".to_string(),
            partitions: 10,
            fetch_limit: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl MessagingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::Config("messaging partitions must be at least 1".to_string()));
        }
        if self.fetch_limit == 0 {
            return Err(Error::Config("messaging fetch_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Topic carrying `partition`
    pub fn topic(&self, partition: u32) -> TopicId {
        TopicId::system(format!("{}{}", self.topic_prefix, partition))
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{} has invalid value '{}': {}", name, raw, e)))
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the backing table store from environment
    ///
    /// Environment variables:
    /// - TABLE_BACKEND: "memory" (default)
    pub fn create_table_store() -> Result<Arc<dyn TableStore>> {
        let backend = std::env::var("TABLE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory table store (standalone mode)");
                Ok(Arc::new(InMemoryTableStore::new()))
            }
            _ => Err(Error::Config(format!(
                "Unknown TABLE_BACKEND: {}. Use 'memory'",
                backend
            ))),
        }
    }

    /// Create the message bus from environment
    ///
    /// Environment variables:
    /// - MESSAGING_BACKEND: "memory" (default); partition topics are created up front
    pub fn create_messaging_service(config: &MessagingConfig) -> Result<Arc<dyn MessagingService>> {
        let backend = std::env::var("MESSAGING_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!(
                    partitions = config.partitions,
                    topic_prefix = %config.topic_prefix,
                    "Using in-memory messaging service (standalone mode)"
                );
                let service = InMemoryMessagingService::new();
                for partition in 0..config.partitions {
                    service.create_topic(config.topic(partition));
                }
                Ok(Arc::new(service))
            }
            _ => Err(Error::Config(format!(
                "Unknown MESSAGING_BACKEND: {}. Use 'memory'",
                backend
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MetricsConfig::default();
        assert_eq!(config.retention_for(Resolution::Second), Some(Duration::from_secs(7200)));
        assert_eq!(
            config.retention_for(Resolution::Hour),
            Some(Duration::from_secs(30 * 24 * 3600))
        );
        assert_eq!(config.retention_for(Resolution::Total), None);
        assert_eq!(config.roll_time_for(Resolution::Minute), 3600);
        assert_eq!(config.roll_time_for(Resolution::Total), 1);
        assert!(config.messaging.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(
            MetricsConfig::fact_table_name(&config.fact_table_prefix, Resolution::Minute),
            "metrics.v3.table.ts.60"
        );
    }

    #[test]
    fn test_env_overlay() {
        let config = MetricsConfig::from_lookup(lookup(&[
            ("METRICS_RETENTION_SECOND_SECS", "3600"),
            ("METRICS_ROLL_TIME_MINUTE", "60"),
            ("METRICS_SPLITS", "4"),
            ("METRICS_MESSAGING_PARTITIONS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.retention_for(Resolution::Second), Some(Duration::from_secs(3600)));
        assert_eq!(config.roll_time_for(Resolution::Minute), 60);
        assert_eq!(config.roll_time_for(Resolution::Hour), 3600);
        assert_eq!(config.splits, 4);
        let messaging = config.messaging.unwrap();
        assert_eq!(messaging.partitions, 3);
        assert_eq!(messaging.topic(2), TopicId::system("metrics2"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = MetricsConfig::from_lookup(lookup(&[("METRICS_SPLITS", "many")])).unwrap_err();
        assert!(err.to_string().contains("METRICS_SPLITS"));

        assert!(MetricsConfig::from_lookup(lookup(&[("METRICS_ROW_KEY_BUCKETS", "300")])).is_err());
        assert!(MetricsConfig::from_lookup(lookup(&[("METRICS_ROLL_TIME", "70000")])).is_err());
        let partitions = lookup(&[("METRICS_MESSAGING_PARTITIONS", "0")]);
        assert!(MetricsConfig::from_lookup(partitions).is_err());
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        let err = MetricsConfig::from_lookup(lookup(&[("METRICS_RETENTION_SECOND_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("retention for second"));

        let mut config = MetricsConfig::default();
        config.retention.insert(Resolution::Hour, Duration::ZERO);
        assert!(config.validate().is_err());
        config.retention.insert(Resolution::Hour, Duration::from_millis(500));
        assert!(config.validate().is_err());

        // TOTAL never expires, so a window for it is ignored
        config.retention.insert(Resolution::Hour, Duration::from_secs(60));
        config.retention.insert(Resolution::Total, Duration::ZERO);
        assert!(config.validate().is_ok());
    }
}
