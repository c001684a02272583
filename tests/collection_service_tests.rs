//! Integration tests for the metrics collection service lifecycle

use metricstore::clock::ManualClock;
use metricstore::collect::{MetricsCollectionService, SchedulerState};
use metricstore::config::{MessagingConfig, MetricsConfig};
use metricstore::messaging::{codec, InMemoryMessagingService, MessagingService};
use metricstore::process::MessagingMetricsProcessorFactory;
use metricstore::schema::{MetricValue, Resolution, Tags, TimePoint, TimeRange};
use metricstore::store::FactTableFactory;
use metricstore::table::{DatasetId, InMemoryTableStore};
use metricstore::Error;
use std::sync::Arc;
use std::time::Duration;

const NOW: i64 = 1_700_000_000;

fn tags(namespace: &str) -> Tags {
    [("namespace".to_string(), namespace.to_string())].into_iter().collect()
}

fn config() -> MetricsConfig {
    MetricsConfig {
        flush_interval: Duration::from_secs(60),
        ..MetricsConfig::default()
    }
}

async fn service(tables: Arc<InMemoryTableStore>) -> MetricsCollectionService {
    let factory = FactTableFactory::new(tables, config()).unwrap();
    MetricsCollectionService::new(&factory, Arc::new(ManualClock::new(NOW)))
        .await
        .unwrap()
}

/// Service consuming two partitions with a fast poll interval
async fn service_with_processor(
    tables: Arc<InMemoryTableStore>,
) -> (MetricsCollectionService, Arc<InMemoryMessagingService>, MessagingConfig) {
    let messaging_config = MessagingConfig {
        partitions: 2,
        poll_interval: Duration::from_millis(10),
        ..MessagingConfig::default()
    };
    let messaging = Arc::new(InMemoryMessagingService::new());
    for partition in 0..messaging_config.partitions {
        messaging.create_topic(messaging_config.topic(partition));
    }

    let factory = FactTableFactory::new(tables, config()).unwrap();
    let service = MetricsCollectionService::new(&factory, Arc::new(ManualClock::new(NOW)))
        .await
        .unwrap();
    let processor_factory = MessagingMetricsProcessorFactory::new(
        messaging.clone(),
        service.store().clone(),
        factory.create_consumer_meta().await.unwrap(),
        messaging_config.clone(),
    );
    (
        service.with_messaging_processor(processor_factory),
        messaging,
        messaging_config,
    )
}

#[tokio::test]
async fn test_publish_then_query() {
    let service = service(Arc::new(InMemoryTableStore::new())).await;
    service
        .publish(&[
            MetricValue::counter(tags("NS_1"), "jobs.completed", NOW, 2),
            MetricValue::counter(tags("NS_1"), "jobs.completed", NOW + 1, 3),
        ])
        .await
        .unwrap();

    let total = service
        .store()
        .query(Resolution::Total, &tags("NS_1"), "jobs.completed", TimeRange::new(0, 0))
        .await
        .unwrap();
    assert_eq!(total, vec![TimePoint::new(0, 5)]);
}

#[tokio::test]
async fn test_publish_failure_is_returned() {
    let tables = Arc::new(InMemoryTableStore::new());
    let service = service(tables.clone()).await;
    tables
        .table(&DatasetId::system("metrics.v3.table.ts.60"))
        .unwrap()
        .set_unavailable(true);

    let err = service
        .publish(&[MetricValue::gauge(tags("NS_1"), "queue.size", NOW, 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StorageUnavailable(_)));
}

#[tokio::test]
async fn test_context_values_flushed_to_store() {
    let service = service(Arc::new(InMemoryTableStore::new())).await;
    let context = service.context().child([("namespace", "NS_2"), ("app", "APP_1")]);
    context.increment("records.in", 4);
    context.increment("records.in", 6);
    context.gauge("buffer.size", 12);

    assert_eq!(service.flush().await.unwrap(), 2);
    assert_eq!(service.flush().await.unwrap(), 0);

    let records = service
        .store()
        .query(Resolution::Second, &tags("NS_2"), "records.in", TimeRange::new(NOW, NOW))
        .await
        .unwrap();
    assert_eq!(records, vec![TimePoint::new(NOW, 10)]);
}

#[tokio::test]
async fn test_start_and_shut_down() {
    let service = service(Arc::new(InMemoryTableStore::new())).await;
    assert_eq!(service.scheduler_state(), None);

    service.start_up().await.unwrap();
    assert!(service.scheduler_state().is_some());

    // pending values are flushed on shutdown
    service.context().child([("namespace", "NS_1")]).increment("tasks", 1);
    service.shut_down().await.unwrap();
    assert_eq!(service.scheduler_state(), None);

    let total = service
        .store()
        .query(Resolution::Total, &tags("NS_1"), "tasks", TimeRange::new(0, 0))
        .await
        .unwrap();
    assert_eq!(total, vec![TimePoint::new(0, 1)]);
}

#[tokio::test]
async fn test_processor_feeds_store() {
    let (service, messaging, messaging_config) =
        service_with_processor(Arc::new(InMemoryTableStore::new())).await;
    service.start_up().await.unwrap();

    let batch = [MetricValue::counter(tags("NS_1"), "counter_metric", NOW, 7)];
    let payload = codec::encode(&batch).unwrap();
    messaging.publish(&messaging_config.topic(1), payload).await.unwrap();

    let mut points = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        points = service
            .store()
            .query(Resolution::Total, &tags("NS_1"), "counter_metric", TimeRange::new(0, 0))
            .await
            .unwrap();
        if !points.is_empty() {
            break;
        }
    }
    assert_eq!(points, vec![TimePoint::new(0, 7)]);

    service.shut_down().await.unwrap();

    // the processor's own metrics are flushed under the system namespace
    let processed = service
        .store()
        .query(Resolution::Total, &tags("system"), "process.count", TimeRange::new(0, 0))
        .await
        .unwrap();
    assert_eq!(processed, vec![TimePoint::new(0, 1)]);
}

#[tokio::test]
async fn test_start_fails_on_missing_topic() {
    let (service, messaging, messaging_config) =
        service_with_processor(Arc::new(InMemoryTableStore::new())).await;
    messaging.delete_topic(&messaging_config.topic(0));

    let err = service.start_up().await.unwrap_err();
    assert!(matches!(err, Error::TopicNotFound(_)));
    service.shut_down().await.unwrap();
}

#[tokio::test]
async fn test_single_shutdown_failure_is_returned_as_is() {
    let tables = Arc::new(InMemoryTableStore::new());
    let service = service(tables.clone()).await;
    service.start_up().await.unwrap();

    service.context().child([("namespace", "NS_1")]).increment("tasks", 1);
    tables
        .table(&DatasetId::system("metrics.v3.table.ts.1"))
        .unwrap()
        .set_unavailable(true);

    let err = service.shut_down().await.unwrap_err();
    assert!(matches!(err, Error::StorageUnavailable(_)));
    assert!(err.suppressed().is_empty());
}

#[tokio::test]
async fn test_shutdown_failures_are_aggregated() {
    let tables = Arc::new(InMemoryTableStore::new());
    let (service, messaging, messaging_config) = service_with_processor(tables.clone()).await;
    service.start_up().await.unwrap();
    assert!(matches!(
        service.scheduler_state(),
        Some(SchedulerState::Scheduled) | Some(SchedulerState::Running)
    ));

    // partition 0 loses its topic and its task fails
    messaging.delete_topic(&messaging_config.topic(0));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // and the final aggregation flush cannot reach storage
    service.context().child([("namespace", "NS_1")]).increment("tasks", 1);
    tables
        .table(&DatasetId::system("metrics.v3.table.ts.1"))
        .unwrap()
        .set_unavailable(true);

    let err = service.shut_down().await.unwrap_err();
    assert!(matches!(err, Error::ShutdownAggregate { .. }));
    assert!(matches!(err.primary(), Error::TopicNotFound(_)));
    assert_eq!(err.suppressed().len(), 1);
    assert!(matches!(err.suppressed()[0], Error::StorageUnavailable(_)));
}
