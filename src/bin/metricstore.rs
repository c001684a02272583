//! metricstore service binary
//!
//! Runs the metrics collection service against the configured table store,
//! optionally consuming metric batches from messaging partitions.

use metricstore::clock::BoundedClock;
use metricstore::collect::MetricsCollectionService;
use metricstore::config::{ComponentFactory, MessagingConfig, MetricsConfig};
use metricstore::process::MessagingMetricsProcessorFactory;
use metricstore::store::FactTableFactory;
use metricstore::telemetry::Telemetry;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// metricstore
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Aggregation flush interval in seconds
    #[arg(long, env = "METRICS_FLUSH_INTERVAL_SECS")]
    flush_interval_secs: Option<u64>,

    /// Number of messaging partitions to consume; omit to disable the processor
    #[arg(long, env = "METRICS_MESSAGING_PARTITIONS")]
    messaging_partitions: Option<u32>,

    /// Create all metrics datasets and exit
    #[arg(long)]
    setup_only: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("metricstore", &args.log_level)?;

    info!("Starting metricstore");

    let mut config = MetricsConfig::from_env()?;
    if let Some(secs) = args.flush_interval_secs {
        config.flush_interval = Duration::from_secs(secs);
    }
    if let Some(partitions) = args.messaging_partitions {
        config.messaging = Some(MessagingConfig {
            partitions,
            ..config.messaging.unwrap_or_default()
        });
    }
    config.validate()?;

    let table_store = ComponentFactory::create_table_store()?;
    let factory = FactTableFactory::new(table_store, config.clone())?;

    if args.setup_only {
        factory.setup_datasets().await?;
        info!("Datasets created, exiting");
        return Ok(());
    }

    let clock = Arc::new(BoundedClock::default());
    let mut service = MetricsCollectionService::new(&factory, clock).await?;

    if let Some(messaging_config) = &config.messaging {
        let messaging = ComponentFactory::create_messaging_service(messaging_config)?;
        let processor_factory = MessagingMetricsProcessorFactory::new(
            messaging,
            service.store().clone(),
            factory.create_consumer_meta().await?,
            messaging_config.clone(),
        )
        .with_instance(format!("metricstore-{}", std::process::id()));
        service = service.with_messaging_processor(processor_factory);
    }

    service.start_up().await?;

    info!(
        flush_interval_secs = config.flush_interval.as_secs(),
        messaging_partitions = config.messaging.as_ref().map(|m| m.partitions),
        row_key_buckets = config.row_key_buckets,
        "metricstore ready"
    );

    shutdown_signal().await;

    info!("metricstore shutting down");
    service.shut_down().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
