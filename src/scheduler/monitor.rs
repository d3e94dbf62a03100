//! Bulk and single check runs.
//!
//! A bulk run fans out one task per active target and joins them all; a
//! failing task only costs its own target.

use crate::db::{CheckRecord, DbError, HistoryStore, Target};
use crate::probe::{ProbeResult, Prober};

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Infrastructure failures of a check run.
///
/// A target being down is not one of these; that is a normal result.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid target {id}: {reason}")]
    InvalidTarget { id: i64, reason: String },
    #[error("failed to record check: {0}")]
    Storage(#[from] DbError),
    #[error("check task failed: {0}")]
    Task(String),
}

/// Counts for one bulk run.
///
/// Succeeded and failed refer to whether the probe and its persistence
/// completed, independent of whether the target was up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_attempted: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
}

/// Probes targets and records the outcomes.
#[derive(Clone)]
pub struct Monitor {
    prober: Prober,
    history: Arc<dyn HistoryStore>,
    jitter: Duration,
}

impl Monitor {
    pub fn new(prober: Prober, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            prober,
            history,
            jitter: Duration::ZERO,
        }
    }

    /// Delay each bulk task by a random amount up to `jitter` before probing.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check one target now and record the result.
    ///
    /// Persistence failures are returned to the caller.
    pub async fn run_one(&self, target: &Target) -> Result<ProbeResult, MonitorError> {
        check_and_record(&self.prober, self.history.as_ref(), target).await
    }

    /// Check every active target in `targets` concurrently.
    ///
    /// Waits for all of them to settle before returning.
    pub async fn run_all(&self, targets: &[Target]) -> RunSummary {
        let mut tasks = JoinSet::new();
        let max_jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);

        for target in targets.iter().filter(|t| t.is_active) {
            let delay = if max_jitter_ms > 0 {
                Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
            } else {
                Duration::ZERO
            };

            let prober = self.prober.clone();
            let history = self.history.clone();
            let target = target.clone();

            tasks.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let outcome = check_and_record(&prober, history.as_ref(), &target).await;
                (target, outcome)
            });
        }

        let mut summary = RunSummary {
            total_attempted: tasks.len(),
            ..Default::default()
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => summary.succeeded_count += 1,
                Ok((target, Err(e))) => {
                    tracing::warn!("Check failed for {} ({}): {}", target.name, target.id, e);
                    summary.failed_count += 1;
                }
                Err(e) => {
                    let err = MonitorError::Task(e.to_string());
                    tracing::warn!("{}", err);
                    summary.failed_count += 1;
                }
            }
        }

        tracing::info!(
            "Monitored {} targets: {} succeeded, {} failed",
            summary.total_attempted,
            summary.succeeded_count,
            summary.failed_count
        );

        summary
    }
}

async fn check_and_record(
    prober: &Prober,
    history: &dyn HistoryStore,
    target: &Target,
) -> Result<ProbeResult, MonitorError> {
    if target.address.trim().is_empty() {
        return Err(MonitorError::InvalidTarget {
            id: target.id,
            reason: "address is empty".to_string(),
        });
    }

    let result = prober.check(&target.address, target.kind).await;
    if !result.is_up() {
        tracing::debug!(
            "{} is down: {}",
            target.name,
            result.error_message.as_deref().unwrap_or("no diagnostic")
        );
    }

    let record = CheckRecord::new(target.id, Utc::now(), &result);
    history.append_check(&record)?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::probe::{Outcome, ProbeSettings, ProtocolKind};
    use crate::test_support::spawn_responder;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Keeps appended records in memory and refuses the listed targets.
    #[derive(Default)]
    struct MemoryHistory {
        records: Mutex<Vec<CheckRecord>>,
        refuse: HashSet<i64>,
    }

    impl HistoryStore for MemoryHistory {
        fn append_check(&self, record: &CheckRecord) -> Result<i64, DbError> {
            if self.refuse.contains(&record.target_id) {
                return Err(DbError::Poisoned);
            }
            let mut records = self.records.lock().unwrap();
            records.push(record.clone());
            Ok(records.len() as i64)
        }
    }

    fn prober(timeout: Duration) -> Prober {
        Prober::new(ProbeSettings {
            timeout,
            ..Default::default()
        })
        .unwrap()
    }

    fn target(id: i64, address: &str, kind: ProtocolKind) -> Target {
        Target {
            id,
            name: format!("target-{}", id),
            address: address.to_string(),
            kind,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_one_records_result() {
        let addr = spawn_responder().await;
        let history = Arc::new(MemoryHistory::default());
        let monitor = Monitor::new(prober(Duration::from_secs(5)), history.clone());

        let result = monitor
            .run_one(&target(1, &addr.to_string(), ProtocolKind::Http))
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Up);
        assert_eq!(result.status_code, Some(200));

        let records = history.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_id, 1);
        assert_eq!(records[0].probe_result(), result);
    }

    #[tokio::test]
    async fn test_run_one_propagates_storage_failure() {
        let addr = spawn_responder().await;
        let history = Arc::new(MemoryHistory {
            refuse: HashSet::from([7]),
            ..Default::default()
        });
        let monitor = Monitor::new(prober(Duration::from_secs(5)), history);

        let err = monitor
            .run_one(&target(7, &addr.to_string(), ProtocolKind::Http))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Storage(_)));
    }

    #[tokio::test]
    async fn test_run_one_rejects_empty_address() {
        let history = Arc::new(MemoryHistory::default());
        let monitor = Monitor::new(prober(Duration::from_secs(1)), history.clone());

        let err = monitor
            .run_one(&target(3, "   ", ProtocolKind::Https))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidTarget { id: 3, .. }));
        assert!(history.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_all_isolates_unresolvable_target() {
        let addr = spawn_responder().await;
        let history = Arc::new(MemoryHistory::default());
        let monitor =
            Monitor::new(prober(Duration::from_secs(10)), history.clone()).with_jitter(Duration::from_millis(20));

        let targets = vec![
            target(1, &addr.to_string(), ProtocolKind::Http),
            target(2, &format!("http://{}/status/204", addr), ProtocolKind::Http),
            target(3, "nonexistent.invalid", ProtocolKind::Https),
            target(4, &format!("http://{}/status/500", addr), ProtocolKind::Http),
        ];

        let summary = monitor.run_all(&targets).await;
        assert_eq!(
            summary,
            RunSummary {
                total_attempted: 4,
                succeeded_count: 4,
                failed_count: 0,
            }
        );

        let records = history.records.lock().unwrap();
        assert_eq!(records.len(), 4);
        let unresolvable = records.iter().find(|r| r.target_id == 3).unwrap();
        assert_eq!(unresolvable.outcome, Outcome::Down);
        assert_eq!(unresolvable.status_code, None);
        let ups = records.iter().filter(|r| r.outcome == Outcome::Up).count();
        assert_eq!(ups, 2);
    }

    #[tokio::test]
    async fn test_run_all_counts_storage_failures() {
        let addr = spawn_responder().await;
        let history = Arc::new(MemoryHistory {
            refuse: HashSet::from([2]),
            ..Default::default()
        });
        let monitor = Monitor::new(prober(Duration::from_secs(5)), history.clone());

        let targets = vec![
            target(1, &addr.to_string(), ProtocolKind::Http),
            target(2, &addr.to_string(), ProtocolKind::Http),
            target(3, "", ProtocolKind::Http),
        ];

        let summary = monitor.run_all(&targets).await;
        assert_eq!(summary.total_attempted, 3);
        assert_eq!(summary.succeeded_count, 1);
        assert_eq!(summary.failed_count, 2);
        assert_eq!(history.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_all_skips_inactive_targets() {
        let addr = spawn_responder().await;
        let history = Arc::new(MemoryHistory::default());
        let monitor = Monitor::new(prober(Duration::from_secs(5)), history.clone());

        let mut paused = target(2, &addr.to_string(), ProtocolKind::Http);
        paused.is_active = false;
        let targets = vec![target(1, &addr.to_string(), ProtocolKind::Http), paused];

        let summary = monitor.run_all(&targets).await;
        assert_eq!(summary.total_attempted, 1);
        assert_eq!(summary.succeeded_count, 1);

        let records = history.records.lock().unwrap();
        assert!(records.iter().all(|r| r.target_id == 1));
    }

    #[tokio::test]
    async fn test_slow_target_does_not_hold_up_others() {
        let addr = spawn_responder().await;
        let history = Arc::new(MemoryHistory::default());
        let timeout = Duration::from_millis(400);
        let monitor = Monitor::new(prober(timeout), history.clone());

        let targets = vec![
            target(1, &format!("http://{}/slow", addr), ProtocolKind::Http),
            target(2, &addr.to_string(), ProtocolKind::Http),
        ];

        let start = std::time::Instant::now();
        let summary = monitor.run_all(&targets).await;
        assert!(start.elapsed() < timeout * 4);
        assert_eq!(summary.succeeded_count, 2);

        let records = history.records.lock().unwrap();
        let slow = records.iter().find(|r| r.target_id == 1).unwrap();
        let fast = records.iter().find(|r| r.target_id == 2).unwrap();
        assert_eq!(slow.outcome, Outcome::Down);
        assert_eq!(fast.outcome, Outcome::Up);
    }

    #[tokio::test]
    async fn test_run_all_with_sqlite_history() {
        let addr = spawn_responder().await;
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut registered = target(0, &addr.to_string(), ProtocolKind::Http);
        store.add_target(&mut registered).unwrap();

        let monitor = Monitor::new(prober(Duration::from_secs(5)), store.clone());
        let summary = monitor.run_all(&store.get_active_targets().unwrap()).await;
        assert_eq!(summary.succeeded_count, 1);

        let checks = store
            .get_checks(registered.id, Utc::now() - ChronoDuration::minutes(1), Utc::now())
            .unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].outcome, Outcome::Up);
    }

    #[test]
    fn test_summary_payload_shape() {
        let json = serde_json::to_value(RunSummary {
            total_attempted: 3,
            succeeded_count: 2,
            failed_count: 1,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"totalAttempted": 3, "succeededCount": 2, "failedCount": 1}));
    }
}
