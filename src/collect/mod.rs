//! Metrics collection service
//!
//! Ties together the aggregation layer, the optional messaging processor and
//! the retention scheduler, and persists published batches into the metric
//! store.

mod aggregator;
mod retention;

pub use aggregator::{MetricsAggregator, MetricsContext, MetricsPublisher};
pub use retention::{RetentionScheduler, SchedulerState};

use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::process::{MessagingMetricsProcessor, MessagingMetricsProcessorFactory};
use crate::schema::MetricValue;
use crate::store::{FactTableFactory, MetricStore};
use crate::table::SYSTEM_NAMESPACE;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Component tag value of the messaging processor's own metrics
pub const PROCESSOR_COMPONENT: &str = "metrics.processor";

/// Collection service: persists published metrics and manages the
/// background ingestion and cleanup tasks.
pub struct MetricsCollectionService {
    config: MetricsConfig,
    store: MetricStore,
    clock: Arc<dyn Clock>,
    aggregator: Arc<MetricsAggregator>,
    processor_factory: Option<MessagingMetricsProcessorFactory>,
    processor: Mutex<Option<MessagingMetricsProcessor>>,
    scheduler: Mutex<Option<RetentionScheduler>>,
    flush_task: Mutex<Option<JoinHandle<Result<()>>>>,
    shutdown: CancellationToken,
}

impl MetricsCollectionService {
    /// Open the fact tables for every resolution
    pub async fn new(factory: &FactTableFactory, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = MetricStore::open(factory).await?;
        Ok(Self {
            config: factory.config().clone(),
            store,
            aggregator: Arc::new(MetricsAggregator::new(Arc::clone(&clock))),
            clock,
            processor_factory: None,
            processor: Mutex::new(None),
            scheduler: Mutex::new(None),
            flush_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Also consume metrics from messaging partitions once started
    pub fn with_messaging_processor(mut self, factory: MessagingMetricsProcessorFactory) -> Self {
        self.processor_factory = Some(factory);
        self
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    /// Root context for emitting metrics through the aggregation layer
    pub fn context(&self) -> MetricsContext {
        self.aggregator.context()
    }

    /// Persist a batch at every resolution. Failures are returned, never dropped.
    pub async fn publish(&self, values: &[MetricValue]) -> Result<()> {
        self.store.add_all(values).await
    }

    /// Publish everything the aggregation layer holds right now
    pub async fn flush(&self) -> Result<usize> {
        self.aggregator.flush(&self.store).await
    }

    pub fn scheduler_state(&self) -> Option<SchedulerState> {
        self.scheduler.lock().as_ref().map(RetentionScheduler::state)
    }

    pub async fn start_up(&self) -> Result<()> {
        {
            let mut flush_task = self.flush_task.lock();
            if flush_task.is_none() {
                let publisher: Arc<dyn MetricsPublisher> = Arc::new(self.store.clone());
                *flush_task = Some(tokio::spawn(Arc::clone(&self.aggregator).run(
                    publisher,
                    self.config.flush_interval,
                    self.shutdown.child_token(),
                )));
            }
        }

        if let Some(factory) = &self.processor_factory {
            let partitions: Vec<u32> = (0..factory.config().partitions).collect();
            let context = self.context().child([
                ("namespace", SYSTEM_NAMESPACE),
                ("component", PROCESSOR_COMPONENT),
            ]);
            let processor = factory.create(partitions, context);
            processor.start().await?;
            *self.processor.lock() = Some(processor);
        }

        if self.store.native_ttl() {
            info!("Table store expires data natively, retention scheduler not started");
        } else {
            let scheduler =
                RetentionScheduler::new(self.store.clone(), &self.config, Arc::clone(&self.clock));
            scheduler.start();
            *self.scheduler.lock() = Some(scheduler);
        }

        info!("Metrics collection service started");
        Ok(())
    }

    /// Stop the scheduler, then the messaging processor and the aggregation
    /// layer independently. If both fail the first failure is returned with
    /// the second attached.
    pub async fn shut_down(&self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }

        let mut failure: Option<Error> = None;

        let processor = self.processor.lock().take();
        if let Some(processor) = processor {
            if let Err(e) = processor.stop().await {
                error!(error = %e, "Failed to stop messaging metrics processor");
                failure = Some(e);
            }
        }

        self.shutdown.cancel();
        let flush_task = self.flush_task.lock().take();
        if let Some(task) = flush_task {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("aggregation flush task failed: {}", e))),
            };
            if let Err(e) = result {
                error!(error = %e, "Failed to stop metrics aggregation");
                failure = Some(match failure {
                    Some(primary) => primary.with_suppressed(e),
                    None => e,
                });
            }
        }

        info!("Metrics collection service stopped");
        failure.map_or(Ok(()), Err)
    }
}
