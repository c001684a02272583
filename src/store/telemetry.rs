//! Store and pipeline telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct StoreInstruments {
    fact_writes: Counter<u64>,
    fact_write_failures: Counter<u64>,
    publish_duration_seconds: Histogram<f64>,
    publish_batch_size: Histogram<u64>,
    entity_allocations: Counter<u64>,
    entity_allocation_conflicts: Counter<u64>,
    retention_runs: Counter<u64>,
    retention_rows_deleted: Counter<u64>,
    retention_duration_seconds: Histogram<f64>,
    messaging_messages: Counter<u64>,
    messaging_offset_commits: Counter<u64>,
}

fn instruments() -> &'static StoreInstruments {
    static INSTRUMENTS: OnceLock<StoreInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("metricstore.store");
        StoreInstruments {
            fact_writes: meter
                .u64_counter("metricstore.fact.writes")
                .with_description("Metric values written to fact tables")
                .init(),
            fact_write_failures: meter
                .u64_counter("metricstore.fact.write.failures")
                .with_description("Fact table writes that failed")
                .init(),
            publish_duration_seconds: meter
                .f64_histogram("metricstore.publish.duration")
                .with_description("Time to persist one published batch at every resolution")
                .with_unit("s")
                .init(),
            publish_batch_size: meter
                .u64_histogram("metricstore.publish.batch_size")
                .with_description("Metric values per published batch")
                .init(),
            entity_allocations: meter
                .u64_counter("metricstore.entity.allocations")
                .with_description("New entity ids allocated")
                .init(),
            entity_allocation_conflicts: meter
                .u64_counter("metricstore.entity.allocation.conflicts")
                .with_description("Entity allocations lost to a concurrent writer")
                .init(),
            retention_runs: meter
                .u64_counter("metricstore.retention.runs")
                .with_description("Retention cleanup runs by outcome")
                .init(),
            retention_rows_deleted: meter
                .u64_counter("metricstore.retention.rows_deleted")
                .with_description("Rows removed by retention cleanup")
                .init(),
            retention_duration_seconds: meter
                .f64_histogram("metricstore.retention.duration")
                .with_description("Retention cleanup run duration")
                .with_unit("s")
                .init(),
            messaging_messages: meter
                .u64_counter("metricstore.messaging.messages")
                .with_description("Messages consumed by the messaging processor by outcome")
                .init(),
            messaging_offset_commits: meter
                .u64_counter("metricstore.messaging.offset_commits")
                .with_description("Consumer offsets committed")
                .init(),
        }
    })
}

pub fn record_fact_write(resolution: &'static str, kind: &'static str) {
    instruments().fact_writes.add(
        1,
        &[
            KeyValue::new("resolution", resolution),
            KeyValue::new("kind", kind),
        ],
    );
}

pub fn record_fact_write_failure(resolution: &'static str) {
    instruments()
        .fact_write_failures
        .add(1, &[KeyValue::new("resolution", resolution)]);
}

pub fn record_publish(duration_seconds: f64, values: u64) {
    let i = instruments();
    i.publish_duration_seconds.record(duration_seconds, &[]);
    i.publish_batch_size.record(values, &[]);
}

pub fn record_entity_allocation(entity_type: &'static str) {
    instruments()
        .entity_allocations
        .add(1, &[KeyValue::new("type", entity_type)]);
}

pub fn record_entity_allocation_conflict(entity_type: &'static str) {
    instruments()
        .entity_allocation_conflicts
        .add(1, &[KeyValue::new("type", entity_type)]);
}

pub fn record_retention_run(outcome: &'static str, duration_seconds: f64) {
    let i = instruments();
    i.retention_runs
        .add(1, &[KeyValue::new("outcome", outcome)]);
    i.retention_duration_seconds.record(duration_seconds, &[]);
}

pub fn record_retention_rows_deleted(resolution: &'static str, rows: u64) {
    instruments()
        .retention_rows_deleted
        .add(rows, &[KeyValue::new("resolution", resolution)]);
}

pub fn record_messaging_message(outcome: &'static str) {
    instruments()
        .messaging_messages
        .add(1, &[KeyValue::new("outcome", outcome)]);
}

pub fn record_offset_commit(partitions: u64) {
    instruments().messaging_offset_commits.add(partitions, &[]);
}
