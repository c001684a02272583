//! Periodic retention cleanup for stores without native expiry

use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::schema::Resolution;
use crate::store::{telemetry, MetricStore};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle of the retention scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Running,
    Stopped,
}

struct SchedulerInner {
    store: MetricStore,
    windows: Vec<(Resolution, Duration)>,
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
}

impl SchedulerInner {
    fn set_state(&self, state: SchedulerState) {
        let mut current = self.state.lock();
        // a stopped scheduler never comes back
        if *current != SchedulerState::Stopped {
            *current = state;
        }
    }

    async fn run_once(&self) -> Result<u64> {
        let started = Instant::now();
        let result = self.delete_expired().await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        telemetry::record_retention_run(outcome, started.elapsed().as_secs_f64());
        result.map_err(|e| Error::SchedulingFailure(Box::new(e)))
    }

    async fn delete_expired(&self) -> Result<u64> {
        let mut total = 0;
        for (resolution, window) in &self.windows {
            let cutoff = self.clock.retention_cutoff_secs(*window);
            let removed = self.store.delete_before(*resolution, cutoff).await?;
            telemetry::record_retention_rows_deleted(resolution.as_str(), removed);
            info!(resolution = %resolution, cutoff, removed, "Retention cleanup complete");
            total += removed;
        }
        Ok(total)
    }
}

/// Deletes data past each resolution's retention window on a fixed period.
///
/// The first run happens after a short initial delay. A failed run is logged
/// and counted; the next run still happens. Stopping cancels further runs
/// without waiting for one in flight, which is safe because deletion is
/// idempotent.
pub struct RetentionScheduler {
    inner: Arc<SchedulerInner>,
    initial_delay: Duration,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RetentionScheduler {
    pub fn new(store: MetricStore, config: &MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        let windows = Resolution::ALL
            .iter()
            .filter_map(|res| config.retention_for(*res).map(|window| (*res, window)))
            .collect();
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                windows,
                clock,
                state: Mutex::new(SchedulerState::Idle),
            }),
            initial_delay: config.retention_initial_delay,
            interval: config.retention_interval,
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock()
    }

    /// Resolutions cleaned and their windows
    pub fn windows(&self) -> &[(Resolution, Duration)] {
        &self.inner.windows
    }

    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.state() == SchedulerState::Stopped {
            return;
        }
        self.inner.set_state(SchedulerState::Scheduled);

        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        let (initial_delay, interval) = (self.initial_delay, self.interval);
        *task = Some(tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
                inner.set_state(SchedulerState::Running);
                if let Err(e) = inner.run_once().await {
                    error!(error = %e, "Retention cleanup failed");
                }
                inner.set_state(SchedulerState::Scheduled);
                delay = interval;
            }
        }));
        info!(
            initial_delay_secs = initial_delay.as_secs(),
            interval_secs = interval.as_secs(),
            resolutions = self.inner.windows.len(),
            "Retention scheduler started"
        );
    }

    /// Run one cleanup pass now
    pub async fn run_once(&self) -> Result<u64> {
        self.inner.run_once().await
    }

    /// Cancel pending runs and abort an in-flight one without waiting
    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.inner.state.lock() = SchedulerState::Stopped;
        info!("Retention scheduler stopped");
    }
}

impl Drop for RetentionScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::{MetricValue, Tags, TimeRange};
    use crate::store::FactTableFactory;
    use crate::table::InMemoryTableStore;

    async fn store(config: &MetricsConfig) -> MetricStore {
        let factory =
            FactTableFactory::new(Arc::new(InMemoryTableStore::new()), config.clone()).unwrap();
        MetricStore::open(&factory).await.unwrap()
    }

    #[tokio::test]
    async fn test_total_is_never_scheduled() {
        let config = MetricsConfig::default();
        let scheduler =
            RetentionScheduler::new(store(&config).await, &config, Arc::new(ManualClock::new(0)));
        let resolutions: Vec<_> = scheduler.windows().iter().map(|(r, _)| *r).collect();
        assert_eq!(
            resolutions,
            vec![Resolution::Second, Resolution::Minute, Resolution::Hour]
        );
    }

    #[tokio::test]
    async fn test_run_once_removes_expired_points() {
        let mut config = MetricsConfig::default();
        config.retention.insert(Resolution::Second, Duration::from_secs(3600));
        let store = store(&config).await;
        let now = 100_000;
        let tags: Tags = [("namespace".to_string(), "NS_1".to_string())].into_iter().collect();
        store
            .add_all(&[
                MetricValue::gauge(tags.clone(), "g", now - 7200, 1),
                MetricValue::gauge(tags.clone(), "g", now - 1800, 2),
            ])
            .await
            .unwrap();

        let scheduler =
            RetentionScheduler::new(store.clone(), &config, Arc::new(ManualClock::new(now)));
        assert!(scheduler.run_once().await.unwrap() > 0);

        let points = store
            .query(Resolution::Second, &tags, "g", TimeRange::new(0, now))
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, now - 1800);
        assert_eq!(scheduler.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let config = MetricsConfig {
            retention_initial_delay: Duration::from_secs(3600),
            ..MetricsConfig::default()
        };
        let scheduler =
            RetentionScheduler::new(store(&config).await, &config, Arc::new(ManualClock::new(0)));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.start();
        assert_eq!(scheduler.state(), SchedulerState::Scheduled);
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        scheduler.start();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
