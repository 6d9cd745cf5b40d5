//! Version lifecycle
//!
//! Periodic sweeps classify every active version as hot, warm or cold from
//! its traffic, and retire cold versions that nobody uses. Retiring a version
//! removes it from resolution but keeps it in its timeline so chains through
//! it still build.
//!
//! Classification for a version at `now`:
//! - cold when it has been idle for at least `cold_threshold_ms`
//! - hot when it served at least `hot_threshold` requests within the current
//!   classification window
//! - warm otherwise
//!
//! A cold version that wakes up goes back to warm first; it needs another
//! sweep with hot traffic to become hot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LifecycleConfig;
use crate::db_schema::DbSchemaManager;
use crate::error::{Result, TimescapeError};
use crate::metrics::{MetricsEvent, MetricsSink};
use crate::registry::VersionRegistry;
use crate::version::{Tsv, VersionEntry, VersionStatus};

/// Operator decision that overrides the sweep's own judgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualOverride {
    /// Never retire automatically
    Keep,
    /// Retire on the next sweep regardless of traffic
    Deactivate,
}

/// Why a version was retired or brought back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleReason {
    /// Cold with too few requests
    Unused,
    /// Retired through a `Deactivate` override
    Override,
    /// Retired through [`LifecycleManager::deactivate`]
    Manual { forced: bool },
    Reactivated,
}

impl fmt::Display for LifecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleReason::Unused => f.write_str("unused"),
            LifecycleReason::Override => f.write_str("override"),
            LifecycleReason::Manual { forced: false } => f.write_str("manual"),
            LifecycleReason::Manual { forced: true } => f.write_str("manual (forced)"),
            LifecycleReason::Reactivated => f.write_str("reactivated"),
        }
    }
}

/// One entry of the append-only lifecycle history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleRecord {
    pub tsv: Tsv,
    pub handler_path: String,
    pub status: VersionStatus,
    pub reason: LifecycleReason,
    pub request_count: u64,
    pub at: DateTime<Utc>,
}

/// A status change observed by a sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub tsv: Tsv,
    pub from: VersionStatus,
    pub to: VersionStatus,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub transitions: Vec<Transition>,
    /// Versions that met the retirement rules
    pub eligible: Vec<Tsv>,
    /// Versions actually retired; empty in dry-run mode
    pub deactivated: Vec<Tsv>,
    /// Retirements aborted by an error, with the reason
    pub failed: Vec<(Tsv, String)>,
    pub dry_run: bool,
}

struct Window {
    started_at: i64,
    baseline: u64,
}

/// Classifies versions and retires unused ones
pub struct LifecycleManager {
    registry: Arc<VersionRegistry>,
    config: LifecycleConfig,
    db: Option<Arc<DbSchemaManager>>,
    metrics: Arc<dyn MetricsSink>,
    overrides: Mutex<HashMap<Tsv, ManualOverride>>,
    windows: Mutex<HashMap<Tsv, Window>>,
    history: Mutex<Vec<LifecycleRecord>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<VersionRegistry>,
        config: LifecycleConfig,
        db: Option<Arc<DbSchemaManager>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            config,
            db,
            metrics,
            overrides: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Classify one version at `now`, rolling its request window forward
    pub fn classify(&self, entry: &VersionEntry, now: i64) -> VersionStatus {
        let count = entry.request_count();
        let in_window = {
            let mut windows = self.windows.lock();
            let window = windows.entry(entry.tsv().clone()).or_insert(Window {
                started_at: now,
                baseline: count,
            });
            if now - window.started_at >= self.config.classification_window_ms {
                window.started_at = now;
                window.baseline = count;
            }
            count.saturating_sub(window.baseline)
        };

        let idle = now - entry.last_accessed_at();
        let computed = if idle >= self.config.cold_threshold_ms {
            VersionStatus::Cold
        } else if in_window >= self.config.hot_threshold {
            VersionStatus::Hot
        } else {
            VersionStatus::Warm
        };

        if entry.status() == VersionStatus::Cold && computed == VersionStatus::Hot {
            VersionStatus::Warm
        } else {
            computed
        }
    }

    /// First protected tag on `tsv`, if any
    pub fn protected_tag(&self, tsv: &Tsv) -> Option<String> {
        let tags = self.registry.get_tags_for_version(tsv);
        self.config
            .protected_tags
            .iter()
            .find(|p| tags.contains(p))
            .cloned()
    }

    fn retirement_reason(&self, handler_path: &str, entry: &VersionEntry, status: VersionStatus) -> Option<LifecycleReason> {
        let tsv = entry.tsv();
        match self.overrides.lock().get(tsv) {
            Some(ManualOverride::Keep) => return None,
            Some(ManualOverride::Deactivate) => return Some(LifecycleReason::Override),
            None => {}
        }
        if status != VersionStatus::Cold
            || entry.request_count() >= self.config.min_request_count
            || self.protected_tag(tsv).is_some()
            || self.config.excluded_handlers.iter().any(|h| h == handler_path)
        {
            return None;
        }
        // Live code must keep a version to run as.
        if self.registry.live_version(handler_path).ok().as_ref() == Some(tsv) {
            return None;
        }
        Some(LifecycleReason::Unused)
    }

    /// Classify every active version and retire the eligible ones
    pub async fn sweep(&self) -> SweepReport {
        let now = self.registry.clock().now_millis();
        let dry_run = self.config.dry_run;
        let mut report = SweepReport {
            dry_run,
            ..Default::default()
        };

        let mut candidates = Vec::new();
        for handler_path in self.registry.handlers() {
            if let Some(timeline) = self.registry.timeline(&handler_path) {
                for entry in timeline.entries().iter().filter(|e| e.is_active()) {
                    candidates.push((handler_path.clone(), entry.clone()));
                }
            }
        }

        for (handler_path, entry) in candidates {
            report.evaluated += 1;
            let tsv = entry.tsv().clone();
            let previous = entry.status();
            let status = self.classify(&entry, now);

            if status != previous {
                if !dry_run {
                    if let Err(e) = self.registry.set_status(&tsv, status) {
                        tracing::warn!("Could not update status of {}: {}", tsv, e);
                        continue;
                    }
                }
                report.transitions.push(Transition {
                    tsv: tsv.clone(),
                    from: previous,
                    to: status,
                });
            }

            let Some(reason) = self.retirement_reason(&handler_path, &entry, status) else {
                continue;
            };
            report.eligible.push(tsv.clone());
            if dry_run {
                tracing::info!("[dry run] Would deactivate {} ({})", tsv, reason);
                continue;
            }
            match self.retire(&handler_path, &entry, reason).await {
                Ok(()) => report.deactivated.push(tsv),
                Err(e) => report.failed.push((tsv, e.to_string())),
            }
        }

        tracing::info!(
            "Lifecycle sweep: {} evaluated, {} transitions, {} eligible, {} deactivated, {} failed",
            report.evaluated,
            report.transitions.len(),
            report.eligible.len(),
            report.deactivated.len(),
            report.failed.len()
        );
        report
    }

    async fn retire(&self, handler_path: &str, entry: &VersionEntry, reason: LifecycleReason) -> Result<()> {
        let tsv = entry.tsv();
        if let Some(db) = &self.db {
            if let Err(e) = db.deactivate(tsv).await {
                tracing::warn!("Deactivation of {} aborted: {}", tsv, e);
                return Err(e);
            }
        }
        self.registry.set_status(tsv, VersionStatus::Deactivated)?;
        self.overrides.lock().remove(tsv);
        self.windows.lock().remove(tsv);

        let request_count = entry.request_count();
        self.history.lock().push(LifecycleRecord {
            tsv: tsv.clone(),
            handler_path: handler_path.to_string(),
            status: VersionStatus::Deactivated,
            reason: reason.clone(),
            request_count,
            at: self.registry.clock().now(),
        });
        self.metrics.emit(MetricsEvent::VersionDeactivated {
            handler_path: handler_path.to_string(),
            tsv: tsv.clone(),
            request_count,
            reason: reason.to_string(),
        });
        tracing::info!("Deactivated {} of {} ({})", tsv, handler_path, reason);
        Ok(())
    }

    /// Retire a version now. Versions carrying a protected tag need `force`.
    pub async fn deactivate(&self, tsv: &Tsv, force: bool) -> Result<()> {
        let (handler_path, entry) = self.registry.locate(tsv)?;
        if !entry.is_active() {
            return Ok(());
        }
        if !force {
            if let Some(tag) = self.protected_tag(tsv) {
                return Err(TimescapeError::ProtectedTagViolation { tsv: tsv.clone(), tag });
            }
        }
        self.retire(&handler_path, &entry, LifecycleReason::Manual { forced: force })
            .await
    }

    /// Bring a retired version back as warm
    pub async fn reactivate(&self, tsv: &Tsv) -> Result<()> {
        let (handler_path, entry) = self.registry.locate(tsv)?;
        if entry.is_active() {
            return Ok(());
        }
        if let Some(db) = &self.db {
            db.activate(tsv).await?;
        }
        self.registry.set_status(tsv, VersionStatus::Warm)?;
        // Idle time and window counts from before retirement no longer apply.
        entry.touch(self.registry.clock().now_millis());
        self.windows.lock().remove(tsv);
        self.overrides.lock().remove(tsv);
        self.history.lock().push(LifecycleRecord {
            tsv: tsv.clone(),
            handler_path: handler_path.clone(),
            status: VersionStatus::Warm,
            reason: LifecycleReason::Reactivated,
            request_count: entry.request_count(),
            at: self.registry.clock().now(),
        });
        tracing::info!("Reactivated {} of {}", tsv, handler_path);
        Ok(())
    }

    /// Set or replace the override of a version
    pub fn set_override(&self, tsv: &Tsv, value: ManualOverride) -> Result<()> {
        self.registry.locate(tsv)?;
        self.overrides.lock().insert(tsv.clone(), value);
        Ok(())
    }

    pub fn clear_override(&self, tsv: &Tsv) -> Option<ManualOverride> {
        self.overrides.lock().remove(tsv)
    }

    pub fn override_for(&self, tsv: &Tsv) -> Option<ManualOverride> {
        self.overrides.lock().get(tsv).copied()
    }

    /// Every lifecycle change so far, oldest first
    pub fn history(&self) -> Vec<LifecycleRecord> {
        self.history.lock().clone()
    }
}

enum SchedulerCommand {
    RunNow,
    Stop,
}

/// Runs sweeps on a fixed interval and on demand
pub struct LifecycleScheduler;

impl LifecycleScheduler {
    pub fn start(manager: Arc<LifecycleManager>, interval: Duration) -> SweepHandle {
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            tracing::info!("Lifecycle scheduler started (every {}s)", interval.as_secs());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                    command = rx.recv() => match command {
                        Some(SchedulerCommand::RunNow) => {
                            manager.sweep().await;
                        }
                        Some(SchedulerCommand::Stop) | None => break,
                    },
                }
            }
            tracing::info!("Lifecycle scheduler stopped");
        });
        SweepHandle { tx, task }
    }
}

/// Handle to a running [`LifecycleScheduler`]
pub struct SweepHandle {
    tx: mpsc::Sender<SchedulerCommand>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Queue an immediate sweep
    pub async fn trigger(&self) {
        let _ = self.tx.send(SchedulerCommand::RunNow).await;
    }

    /// Stop the scheduler and wait for an in-flight sweep to finish
    pub async fn stop(self) {
        let _ = self.tx.send(SchedulerCommand::Stop).await;
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ContentHash;
    use crate::clock::ManualClock;
    use crate::metrics::ChannelSink;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<VersionRegistry>,
        old: Tsv,
        new: Tsv,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let registry = Arc::new(VersionRegistry::new(clock.clone()));
        let old = registry
            .register_version("/users", ContentHash::of_str("old"), None)
            .unwrap();
        clock.set(1_000);
        let new = registry
            .register_version("/users", ContentHash::of_str("new"), None)
            .unwrap();
        Fixture { clock, registry, old, new }
    }

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            hot_threshold: 5,
            classification_window_ms: 60_000,
            cold_threshold_ms: 7 * DAY,
            min_request_count: 10,
            ..Default::default()
        }
    }

    fn manager(f: &Fixture, config: LifecycleConfig) -> LifecycleManager {
        LifecycleManager::new(f.registry.clone(), config, None, Arc::new(crate::metrics::NullSink))
    }

    #[tokio::test]
    async fn test_cold_unused_version_is_retired() {
        let f = fixture();
        let (sink, mut rx) = ChannelSink::new();
        let lifecycle = LifecycleManager::new(f.registry.clone(), config(), None, Arc::new(sink));
        f.registry.record_access(&f.old).unwrap();
        f.registry.record_access(&f.old).unwrap();

        f.clock.advance(8 * DAY);
        let report = lifecycle.sweep().await;
        assert_eq!(report.deactivated, vec![f.old.clone()]);
        assert_eq!(f.registry.info(&f.old).unwrap().status, VersionStatus::Deactivated);
        // The live version stays even though it is cold.
        assert_eq!(f.registry.info(&f.new).unwrap().status, VersionStatus::Cold);

        let history = lifecycle.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, LifecycleReason::Unused);
        assert_eq!(history[0].request_count, 2);
        assert_eq!(rx.try_recv().unwrap().name(), "version_deactivated");
    }

    #[tokio::test]
    async fn test_protected_tag_blocks_retirement() {
        let f = fixture();
        f.registry.tag_version(&f.old, "stable", "test").unwrap();
        let lifecycle = manager(&f, config());

        f.clock.advance(8 * DAY);
        let report = lifecycle.sweep().await;
        assert!(report.eligible.is_empty());
        assert!(f.registry.info(&f.old).unwrap().status.is_active());

        let err = lifecycle.deactivate(&f.old, false).await.unwrap_err();
        assert!(matches!(err, TimescapeError::ProtectedTagViolation { .. }));
        lifecycle.deactivate(&f.old, true).await.unwrap();
        assert_eq!(
            lifecycle.history()[0].reason,
            LifecycleReason::Manual { forced: true }
        );
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let f = fixture();
        let lifecycle = manager(
            &f,
            LifecycleConfig {
                dry_run: true,
                ..config()
            },
        );
        f.clock.advance(8 * DAY);
        let report = lifecycle.sweep().await;
        assert!(report.dry_run);
        assert_eq!(report.eligible, vec![f.old.clone()]);
        assert!(report.deactivated.is_empty());
        assert_eq!(f.registry.info(&f.old).unwrap().status, VersionStatus::Warm);
        assert!(lifecycle.history().is_empty());
    }

    #[tokio::test]
    async fn test_overrides() {
        let f = fixture();
        let lifecycle = manager(&f, config());

        lifecycle.set_override(&f.old, ManualOverride::Keep).unwrap();
        f.clock.advance(8 * DAY);
        assert!(lifecycle.sweep().await.deactivated.is_empty());

        lifecycle.set_override(&f.old, ManualOverride::Deactivate).unwrap();
        let report = lifecycle.sweep().await;
        assert_eq!(report.deactivated, vec![f.old.clone()]);
        assert_eq!(lifecycle.override_for(&f.old), None);
    }

    #[tokio::test]
    async fn test_excluded_handler() {
        let f = fixture();
        let lifecycle = manager(
            &f,
            LifecycleConfig {
                excluded_handlers: vec!["/users".to_string()],
                ..config()
            },
        );
        f.clock.advance(8 * DAY);
        assert!(lifecycle.sweep().await.eligible.is_empty());
    }

    #[tokio::test]
    async fn test_hot_and_cold_transitions() {
        let f = fixture();
        let lifecycle = manager(&f, config());

        // First sweep opens the window.
        lifecycle.sweep().await;
        for _ in 0..5 {
            f.registry.record_access(&f.new).unwrap();
        }
        lifecycle.sweep().await;
        assert_eq!(f.registry.info(&f.new).unwrap().status, VersionStatus::Hot);

        f.clock.advance(8 * DAY);
        lifecycle.sweep().await;
        assert_eq!(f.registry.info(&f.new).unwrap().status, VersionStatus::Cold);

        // Heavy traffic after going cold only brings it back to warm.
        for _ in 0..20 {
            f.registry.record_access(&f.new).unwrap();
        }
        lifecycle.sweep().await;
        assert_eq!(f.registry.info(&f.new).unwrap().status, VersionStatus::Warm);
    }

    #[tokio::test]
    async fn test_reactivate() {
        let f = fixture();
        let lifecycle = manager(&f, config());
        lifecycle.deactivate(&f.old, false).await.unwrap();
        assert!(!f.registry.info(&f.old).unwrap().status.is_active());

        lifecycle.reactivate(&f.old).await.unwrap();
        assert_eq!(f.registry.info(&f.old).unwrap().status, VersionStatus::Warm);
        let history = lifecycle.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].reason, LifecycleReason::Reactivated);
    }

    #[tokio::test]
    async fn test_reactivated_version_is_not_retired_again_at_once() {
        let f = fixture();
        let lifecycle = manager(&f, config());
        f.clock.advance(8 * DAY);
        assert_eq!(lifecycle.sweep().await.deactivated, vec![f.old.clone()]);

        lifecycle.reactivate(&f.old).await.unwrap();
        let report = lifecycle.sweep().await;
        assert!(report.eligible.is_empty());
        assert_eq!(f.registry.info(&f.old).unwrap().status, VersionStatus::Warm);

        // Unused for another full cold period, it is retired again.
        f.clock.advance(8 * DAY);
        assert_eq!(lifecycle.sweep().await.deactivated, vec![f.old.clone()]);
    }

    #[tokio::test]
    async fn test_scheduler_runs_on_demand() {
        let f = fixture();
        let lifecycle = Arc::new(manager(&f, config()));
        f.clock.advance(8 * DAY);

        let handle = LifecycleScheduler::start(lifecycle.clone(), Duration::from_secs(3600));
        handle.trigger().await;
        for _ in 0..50 {
            if !lifecycle.history().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
        assert_eq!(lifecycle.history().len(), 1);
    }
}
