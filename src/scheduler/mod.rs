//! Scheduler module for running periodic bulk checks.

mod monitor;

pub use monitor::*;

use crate::db::{DbError, Store};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Triggers a bulk run over the active targets on a fixed interval.
pub struct Scheduler {
    store: Arc<Store>,
    monitor: Arc<Monitor>,
    run_interval: Duration,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a scheduler; a zero `run_interval` disables periodic runs.
    pub fn new(store: Arc<Store>, monitor: Arc<Monitor>, run_interval: Duration) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            store,
            monitor,
            run_interval,
            stop_tx,
        }
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Start the periodic loop. The first run happens immediately.
    pub fn start(&self) {
        if self.run_interval.is_zero() {
            tracing::info!("Scheduler: periodic runs disabled, on-demand checks only");
            return;
        }

        tracing::info!("Starting scheduler, bulk run every {:?}", self.run_interval);

        let store = self.store.clone();
        let monitor = self.monitor.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.run_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("Scheduler stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = run_active(&store, &monitor).await {
                            tracing::error!("Skipping scheduled run, could not list targets: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the periodic loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Run one bulk check over the currently active targets.
    pub async fn run_now(&self) -> Result<RunSummary, DbError> {
        run_active(&self.store, &self.monitor).await
    }
}

async fn run_active(store: &Store, monitor: &Monitor) -> Result<RunSummary, DbError> {
    let targets = store.get_active_targets()?;
    Ok(monitor.run_all(&targets).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Target;
    use crate::probe::{ProbeSettings, Prober, ProtocolKind};
    use crate::test_support::spawn_responder;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::NamedTempFile;

    fn setup(run_interval: Duration) -> (NamedTempFile, Arc<Store>, Scheduler) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let prober = Prober::new(ProbeSettings {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();
        let monitor = Arc::new(Monitor::new(prober, store.clone()));
        let scheduler = Scheduler::new(store.clone(), monitor, run_interval);
        (tmp, store, scheduler)
    }

    fn add(store: &Store, address: &str, is_active: bool) -> Target {
        let mut target = Target {
            name: "local".to_string(),
            address: address.to_string(),
            kind: ProtocolKind::Http,
            is_active,
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        target
    }

    #[tokio::test]
    async fn test_run_now_uses_active_targets() {
        let addr = spawn_responder().await;
        let (_tmp, store, scheduler) = setup(Duration::ZERO);
        let active = add(&store, &addr.to_string(), true);
        let paused = add(&store, &addr.to_string(), false);

        let summary = scheduler.run_now().await.unwrap();
        assert_eq!(summary.total_attempted, 1);
        assert_eq!(summary.succeeded_count, 1);
        assert!(store.get_latest_check(active.id).unwrap().is_some());
        assert!(store.get_latest_check(paused.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_periodic_runs_until_stopped() {
        let addr = spawn_responder().await;
        let (_tmp, store, scheduler) = setup(Duration::from_millis(100));
        let target = add(&store, &addr.to_string(), true);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(450)).await;
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let since = Utc::now() - ChronoDuration::minutes(1);
        let count = store.get_checks(target.id, since, Utc::now()).unwrap().len();
        assert!(count >= 2, "expected several runs, got {}", count);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = store.get_checks(target.id, since, Utc::now()).unwrap().len();
        assert_eq!(count, after);
    }

    #[tokio::test]
    async fn test_zero_interval_never_runs() {
        let addr = spawn_responder().await;
        let (_tmp, store, scheduler) = setup(Duration::ZERO);
        let target = add(&store, &addr.to_string(), true);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.get_latest_check(target.id).unwrap().is_none());
    }
}
