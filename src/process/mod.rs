//! Messaging-based metrics ingestion
//!
//! One task per assigned partition fetches encoded batches, writes them to
//! the metric store and only then commits the partition offset, so a crash
//! in between replays the batch instead of losing it.

use crate::collect::MetricsContext;
use crate::config::MessagingConfig;
use crate::messaging::{codec, MessagingService, TopicId};
use crate::store::{telemetry, ConsumerMetaTable, MetricStore, TopicPartition};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builds processors sharing one message bus, store and offsets table
#[derive(Clone)]
pub struct MessagingMetricsProcessorFactory {
    messaging: Arc<dyn MessagingService>,
    store: MetricStore,
    meta: ConsumerMetaTable,
    config: MessagingConfig,
    instance: String,
}

impl MessagingMetricsProcessorFactory {
    pub fn new(
        messaging: Arc<dyn MessagingService>,
        store: MetricStore,
        meta: ConsumerMetaTable,
        config: MessagingConfig,
    ) -> Self {
        Self {
            messaging,
            store,
            meta,
            config,
            instance: "standalone".to_string(),
        }
    }

    /// Name recorded as metadata alongside committed offsets
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn create(
        &self,
        partitions: Vec<u32>,
        context: MetricsContext,
    ) -> MessagingMetricsProcessor {
        MessagingMetricsProcessor {
            inner: Arc::new(ProcessorInner {
                messaging: Arc::clone(&self.messaging),
                store: self.store.clone(),
                meta: self.meta.clone(),
                config: self.config.clone(),
                instance: self.instance.clone(),
                partitions,
                offsets: DashMap::new(),
                context,
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }
}

struct ProcessorInner {
    messaging: Arc<dyn MessagingService>,
    store: MetricStore,
    meta: ConsumerMetaTable,
    config: MessagingConfig,
    instance: String,
    partitions: Vec<u32>,
    /// Last committed offset per partition
    offsets: DashMap<u32, u64>,
    context: MetricsContext,
}

impl ProcessorInner {
    fn topic_partition(&self, topic: &TopicId, partition: u32) -> TopicPartition {
        TopicPartition::new(topic.topic.clone(), partition)
    }

    async fn process_once(&self, partition: u32) -> Result<usize> {
        let topic = self.config.topic(partition);
        let after = self.offsets.get(&partition).map(|o| *o);
        let messages = self
            .messaging
            .fetch(&topic, after, self.config.fetch_limit)
            .await?;
        let Some(last) = messages.last().map(|m| m.offset) else {
            return Ok(0);
        };

        let mut written = 0usize;
        for message in &messages {
            match codec::decode(&message.payload) {
                Ok(values) => {
                    self.store.add_all(&values).await?;
                    written += values.len();
                    telemetry::record_messaging_message("written");
                }
                Err(e) => {
                    // can never be written, so holding the offset back would stall the partition
                    warn!(
                        topic = %topic,
                        offset = message.offset,
                        error = %e,
                        "Skipping undecodable message"
                    );
                    telemetry::record_messaging_message("skipped");
                    self.context.increment("process.skipped", 1);
                }
            }
        }

        self.meta
            .save_offset(&self.topic_partition(&topic, partition), last, &self.instance)
            .await?;
        self.offsets.insert(partition, last);
        telemetry::record_offset_commit(1);

        self.context.increment("process.count", written as i64);
        self.context.gauge("process.offset", last as i64);
        debug!(
            topic = %topic,
            offset = last,
            messages = messages.len(),
            written,
            "Processed messages"
        );
        Ok(messages.len())
    }
}

/// Consumes metric batches from partition topics into the metric store
pub struct MessagingMetricsProcessor {
    inner: Arc<ProcessorInner>,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
    shutdown: CancellationToken,
}

impl MessagingMetricsProcessor {
    pub fn partitions(&self) -> &[u32] {
        &self.inner.partitions
    }

    /// Last committed offset of a partition
    pub fn committed_offset(&self, partition: u32) -> Option<u64> {
        self.inner.offsets.get(&partition).map(|o| *o)
    }

    /// Check topics, restore committed offsets and spawn the partition tasks
    pub async fn start(&self) -> Result<()> {
        self.restore().await?;

        let mut tasks = self.tasks.lock();
        for &partition in &self.inner.partitions {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(run_partition(inner, partition, shutdown)));
        }
        info!(partitions = ?self.inner.partitions, "Messaging metrics processor started");
        Ok(())
    }

    /// Verify every partition topic exists and load committed offsets
    pub async fn restore(&self) -> Result<()> {
        for &partition in &self.inner.partitions {
            let topic = self.inner.config.topic(partition);
            if !self.inner.messaging.topic_exists(&topic).await? {
                return Err(Error::TopicNotFound(topic.to_string()));
            }
            let tp = self.inner.topic_partition(&topic, partition);
            if let Some(offset) = self.inner.meta.read_offset(&tp).await? {
                info!(topic = %topic, offset, "Resuming partition from committed offset");
                self.inner.offsets.insert(partition, offset);
            }
        }
        Ok(())
    }

    /// Fetch, write and commit one batch of a partition; returns the number
    /// of messages consumed
    pub async fn process_partition_once(&self, partition: u32) -> Result<usize> {
        self.inner.process_once(partition).await
    }

    /// Cancel and join all partition tasks. The first task failure is
    /// returned with any others attached.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());

        let mut failure: Option<Error> = None;
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("partition task failed: {}", e))),
            };
            if let Err(e) = result {
                failure = Some(match failure {
                    Some(primary) => primary.with_suppressed(e),
                    None => e,
                });
            }
        }
        info!("Messaging metrics processor stopped");
        failure.map_or(Ok(()), Err)
    }
}

async fn run_partition(
    inner: Arc<ProcessorInner>,
    partition: u32,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let idle = tokio::select! {
            result = inner.process_once(partition) => match result {
                Ok(consumed) => consumed == 0,
                Err(e @ Error::TopicNotFound(_)) => {
                    error!(
                        partition,
                        error = %e,
                        "Partition topic disappeared, stopping partition"
                    );
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        partition,
                        error = %e,
                        "Failed to process messages, retrying from last committed offset"
                    );
                    true
                }
            },
            _ = shutdown.cancelled() => return Ok(()),
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }
}
