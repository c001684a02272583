//! In-process aggregation of emitted metrics
//!
//! Components record counters and gauges against a [`MetricsContext`]; the
//! aggregator folds them per (tags, name) and a flush loop hands the folded
//! values to a [`MetricsPublisher`] every flush interval.

use crate::clock::Clock;
use crate::schema::{MetricType, MetricValue, Tags};
use crate::store::MetricStore;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Destination of flushed metric batches
#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    async fn publish(&self, values: &[MetricValue]) -> Result<()>;
}

#[async_trait]
impl MetricsPublisher for MetricStore {
    async fn publish(&self, values: &[MetricValue]) -> Result<()> {
        self.add_all(values).await
    }
}

type SeriesKey = (Arc<Tags>, String);

#[derive(Default)]
struct Pending {
    counters: HashMap<SeriesKey, i64>,
    gauges: HashMap<SeriesKey, i64>,
}

/// Accumulates counters (summed) and gauges (last value wins) until flushed
pub struct MetricsAggregator {
    pending: Mutex<Pending>,
    clock: Arc<dyn Clock>,
}

impl MetricsAggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            clock,
        }
    }

    /// Root context with no tags
    pub fn context(self: &Arc<Self>) -> MetricsContext {
        MetricsContext {
            aggregator: Arc::clone(self),
            tags: Arc::new(Tags::new()),
        }
    }

    fn increment(&self, tags: &Arc<Tags>, name: &str, delta: i64) {
        *self
            .pending
            .lock()
            .counters
            .entry((Arc::clone(tags), name.to_string()))
            .or_default() += delta;
    }

    fn gauge(&self, tags: &Arc<Tags>, name: &str, value: i64) {
        self.pending
            .lock()
            .gauges
            .insert((Arc::clone(tags), name.to_string()), value);
    }

    /// Take everything accumulated so far, stamped with the current time
    pub fn drain(&self) -> Vec<MetricValue> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let now = self.clock.now_secs();
        let counters = pending
            .counters
            .into_iter()
            .map(|((tags, name), delta)| {
                MetricValue::with_shared_tags(tags, name, now, delta, MetricType::Counter)
            });
        let gauges = pending
            .gauges
            .into_iter()
            .map(|((tags, name), value)| {
                MetricValue::with_shared_tags(tags, name, now, value, MetricType::Gauge)
            });
        counters.chain(gauges).collect()
    }

    /// Put back values whose publish failed. Counters are re-added; a gauge
    /// recorded since the drain is newer and is kept.
    pub fn requeue(&self, values: Vec<MetricValue>) {
        let mut pending = self.pending.lock();
        for value in values {
            let key = (Arc::clone(value.shared_tags()), value.name().to_string());
            match value.kind() {
                MetricType::Counter => *pending.counters.entry(key).or_default() += value.value(),
                MetricType::Gauge => {
                    pending.gauges.entry(key).or_insert(value.value());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.pending.lock();
        pending.counters.is_empty() && pending.gauges.is_empty()
    }

    /// Publish everything pending. On failure the values are re-queued and
    /// the error is returned.
    pub async fn flush(&self, publisher: &dyn MetricsPublisher) -> Result<usize> {
        let values = self.drain();
        if values.is_empty() {
            return Ok(0);
        }
        match publisher.publish(&values).await {
            Ok(()) => {
                debug!(values = values.len(), "Flushed aggregated metrics");
                Ok(values.len())
            }
            Err(e) => {
                self.requeue(values);
                Err(e)
            }
        }
    }

    /// Flush every `interval` until cancelled, then flush once more and
    /// return the result of that final flush.
    pub async fn run(
        self: Arc<Self>,
        publisher: Arc<dyn MetricsPublisher>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush(publisher.as_ref()).await {
                        error!(error = %e, "Metrics flush failed, values kept for next flush");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Metrics aggregator shutting down, flushing remaining values");
                    return self.flush(publisher.as_ref()).await.map(|_| ());
                }
            }
        }
    }
}

/// Handle for emitting metrics under a fixed set of tags
#[derive(Clone)]
pub struct MetricsContext {
    aggregator: Arc<MetricsAggregator>,
    tags: Arc<Tags>,
}

impl MetricsContext {
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Add `delta` to a counter
    pub fn increment(&self, name: &str, delta: i64) {
        self.aggregator.increment(&self.tags, name, delta);
    }

    /// Set a gauge
    pub fn gauge(&self, name: &str, value: i64) {
        self.aggregator.gauge(&self.tags, name, value);
    }

    /// Context with additional tags; on conflict the new value wins
    pub fn child<I, K, V>(&self, tags: I) -> MetricsContext
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = Tags::clone(&self.tags);
        merged.extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        MetricsContext {
            aggregator: Arc::clone(&self.aggregator),
            tags: Arc::new(merged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingPublisher {
        fail: AtomicBool,
        published: Mutex<Vec<MetricValue>>,
    }

    #[async_trait]
    impl MetricsPublisher for RecordingPublisher {
        async fn publish(&self, values: &[MetricValue]) -> Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(Error::StorageUnavailable("down".into()));
            }
            self.published.lock().extend_from_slice(values);
            Ok(())
        }
    }

    fn aggregator() -> Arc<MetricsAggregator> {
        Arc::new(MetricsAggregator::new(Arc::new(ManualClock::new(100))))
    }

    #[test]
    fn test_counters_sum_and_gauges_keep_last() {
        let aggregator = aggregator();
        let context = aggregator.context().child([("namespace", "NS_1")]);
        context.increment("requests", 2);
        context.increment("requests", 3);
        context.gauge("queue", 7);
        context.gauge("queue", 4);

        let mut values = aggregator.drain();
        values.sort_by(|a, b| a.name().cmp(b.name()));
        assert_eq!(values.len(), 2);
        assert_eq!((values[0].name(), values[0].value()), ("queue", 4));
        assert_eq!((values[1].name(), values[1].value()), ("requests", 5));
        assert_eq!(values[1].timestamp(), 100);
        assert_eq!(values[1].tags()["namespace"], "NS_1");
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_child_contexts_are_separate_series() {
        let aggregator = aggregator();
        let root = aggregator.context();
        root.child([("app", "a")]).increment("c", 1);
        root.child([("app", "b")]).increment("c", 1);
        assert_eq!(aggregator.drain().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_values() {
        let aggregator = aggregator();
        let publisher = RecordingPublisher::default();
        let context = aggregator.context();
        context.increment("c", 1);
        context.gauge("g", 1);

        publisher.fail.store(true, Ordering::Release);
        assert!(aggregator.flush(&publisher).await.is_err());

        context.increment("c", 2);
        context.gauge("g", 9);
        publisher.fail.store(false, Ordering::Release);
        assert_eq!(aggregator.flush(&publisher).await.unwrap(), 2);

        let published = publisher.published.lock();
        let counter = published.iter().find(|v| v.name() == "c").unwrap();
        let gauge = published.iter().find(|v| v.name() == "g").unwrap();
        assert_eq!(counter.value(), 3);
        assert_eq!(gauge.value(), 9);
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let aggregator = aggregator();
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(aggregator.clone().run(
            publisher.clone(),
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        aggregator.context().increment("late", 1);
        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(publisher.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_final_flush_error_is_surfaced() {
        let aggregator = aggregator();
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.fail.store(true, Ordering::Release);
        aggregator.context().increment("c", 1);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = aggregator
            .clone()
            .run(publisher, Duration::from_secs(3600), shutdown)
            .await;
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
        assert!(!aggregator.is_empty());
    }
}
