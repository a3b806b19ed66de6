//! Background scheduler that decides when a sync cycle is worth running.
//!
//! One tokio task ticks on an interval that follows the power source. Each
//! tick either runs pull-then-push on the shared engine or reports why it
//! skipped. Stopping only signals the task; a cycle already running is
//! allowed to finish. The task holds the scheduler weakly, so dropping the
//! last handle stops it too.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Timelike;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::remote::RemoteApi;
use crate::sync::{CycleReport, SyncEngine};
use crate::util::now_millis;

/// Reports whether the device is running on battery
pub trait PowerSource: Send + Sync {
    fn on_battery(&self) -> bool;
}

/// Always on mains power
#[derive(Debug, Clone, Copy, Default)]
pub struct MainsPower;

impl PowerSource for MainsPower {
    fn on_battery(&self) -> bool {
        false
    }
}

/// Why a tick did not run a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InFlight,
    TooSoon,
    QuietHours,
    NothingToDo,
    Unreachable,
}

/// Result of one scheduler tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran(CycleReport),
    Skipped(SkipReason),
    /// The cycle failed; the next tick tries again
    Failed(String),
}

pub struct BackgroundScheduler {
    engine: Arc<SyncEngine>,
    power: Arc<dyn PowerSource>,
    last_run_at: Mutex<Option<i64>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackgroundScheduler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BackgroundScheduler")
            .field("running", &self.is_running())
            .field("interval", &self.current_interval())
            .finish_non_exhaustive()
    }
}

impl BackgroundScheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self::with_power_source(engine, Arc::new(MainsPower))
    }

    pub fn with_power_source(engine: Arc<SyncEngine>, power: Arc<dyn PowerSource>) -> Self {
        Self {
            engine,
            power,
            last_run_at: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub const fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Tick period for the current power source
    pub fn current_interval(&self) -> Duration {
        self.engine
            .settings()
            .tick_interval(self.power.on_battery())
    }

    pub fn is_running(&self) -> bool {
        self.shutdown
            .lock()
            .is_ok_and(|shutdown| shutdown.is_some())
    }

    /// Spawn the tick loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>, remote: Arc<dyn RemoteApi>) -> Result<bool> {
        let mut shutdown = self
            .shutdown
            .lock()
            .map_err(|_| Error::InvalidOperation("scheduler state poisoned".to_string()))?;
        if shutdown.is_some() {
            return Ok(false);
        }

        let (sender, mut receiver) = watch::channel(false);
        let scheduler = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tracing::info!("Background sync started");
            loop {
                let Some(interval) = Self::tick_once(&scheduler, remote.as_ref()).await else {
                    break;
                };
                tokio::select! {
                    changed = receiver.changed() => {
                        if changed.is_err() || *receiver.borrow() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("Background sync stopped");
        });

        *shutdown = Some(sender);
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(true)
    }

    /// One loop iteration; `None` once every handle is gone.
    async fn tick_once(scheduler: &Weak<Self>, remote: &dyn RemoteApi) -> Option<Duration> {
        let scheduler = scheduler.upgrade()?;
        match scheduler.tick(remote).await {
            TickOutcome::Ran(_) => {}
            TickOutcome::Skipped(reason) => {
                tracing::debug!("Sync tick skipped: {reason:?}");
            }
            TickOutcome::Failed(message) => {
                tracing::warn!("Sync tick failed, retrying next tick: {message}");
            }
        }
        Some(scheduler.current_interval())
    }

    /// Signal the loop to exit after the current tick.
    pub fn stop(&self) {
        let sender = self
            .shutdown
            .lock()
            .ok()
            .and_then(|mut shutdown| shutdown.take());
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::error!("Background sync task ended abnormally: {error}");
            }
        }
    }

    pub async fn tick(&self, remote: &dyn RemoteApi) -> TickOutcome {
        let hour = u8::try_from(chrono::Local::now().hour()).unwrap_or_default();
        self.tick_at(remote, now_millis(), hour).await
    }

    /// Evaluate the skip rules for a given time, then run a cycle.
    ///
    /// Cheap local checks come before the network probe.
    pub(crate) async fn tick_at(
        &self,
        remote: &dyn RemoteApi,
        now: i64,
        hour: u8,
    ) -> TickOutcome {
        let settings = self.engine.settings();

        if self.engine.is_in_flight() {
            return TickOutcome::Skipped(SkipReason::InFlight);
        }

        let min_spacing = i64::try_from(settings.min_interval().as_millis()).unwrap_or(i64::MAX);
        let last_run = self.last_run_at.lock().ok().and_then(|last| *last);
        if last_run.is_some_and(|last| now.saturating_sub(last) < min_spacing) {
            return TickOutcome::Skipped(SkipReason::TooSoon);
        }

        if settings.quiet_hours.is_some_and(|quiet| quiet.contains(hour)) {
            return TickOutcome::Skipped(SkipReason::QuietHours);
        }

        match self.has_work(now).await {
            Ok(true) => {}
            Ok(false) => return TickOutcome::Skipped(SkipReason::NothingToDo),
            Err(error) => return TickOutcome::Failed(error.to_string()),
        }

        if !remote.probe().await {
            self.engine.mark_offline();
            return TickOutcome::Skipped(SkipReason::Unreachable);
        }

        if let Ok(mut last) = self.last_run_at.lock() {
            *last = Some(now);
        }
        match self.engine.run_cycle(remote).await {
            Ok(report) => TickOutcome::Ran(report),
            Err(Error::SyncInProgress) => TickOutcome::Skipped(SkipReason::InFlight),
            Err(error) => TickOutcome::Failed(error.to_string()),
        }
    }

    /// Queued writes, or a pull checkpoint older than the overdue window
    async fn has_work(&self, now: i64) -> Result<bool> {
        let db = self.engine.database();
        if db.queue_count().await? > 0 {
            return Ok(true);
        }
        let overdue =
            i64::try_from(self.engine.settings().pull_overdue().as_millis()).unwrap_or(i64::MAX);
        Ok(db
            .last_sync_at()
            .await?
            .is_none_or(|last_sync| now.saturating_sub(last_sync) >= overdue))
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QuietHours, SyncSettings};
    use crate::models::{HttpMethod, NewQueueEntry, ResourceKind};
    use crate::services::DatabaseService;
    use crate::state::SyncState;
    use crate::sync::test_support::MockRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Battery;

    impl PowerSource for Battery {
        fn on_battery(&self) -> bool {
            true
        }
    }

    async fn scheduler_with(settings: SyncSettings) -> Arc<BackgroundScheduler> {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let engine = Arc::new(SyncEngine::new(db, settings).unwrap());
        Arc::new(BackgroundScheduler::new(engine))
    }

    async fn queue_write(scheduler: &BackgroundScheduler) {
        scheduler
            .engine()
            .apply_local_write(NewQueueEntry::new(
                HttpMethod::Put,
                ResourceKind::Employee,
                "e1",
                json!({"name": "Ada"}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_pull_then_push_when_work_is_queued() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        queue_write(&scheduler).await;
        let remote = MockRemote::new();

        let outcome = scheduler.tick_at(&remote, now_millis(), 12).await;

        let TickOutcome::Ran(report) = outcome else {
            panic!("expected a cycle, got {outcome:?}");
        };
        assert_eq!(report.push.pushed, 1);
        assert_eq!(remote.fetch_count(), ResourceKind::ALL.len());
        assert_eq!(remote.sent_paths(), vec!["/api/employees/e1"]);
        assert_eq!(scheduler.engine().state(), SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skips_while_a_cycle_is_in_flight() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        queue_write(&scheduler).await;
        let remote = MockRemote::new();

        let _guard = scheduler.engine().try_begin().unwrap();
        let outcome = scheduler.tick_at(&remote, now_millis(), 12).await;

        assert_eq!(outcome, TickOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(remote.probe_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enforces_minimum_spacing() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        queue_write(&scheduler).await;
        let remote = MockRemote::new();
        remote.fail_sends(crate::remote::TransportError::Network("reset".to_string()));
        let now = now_millis();

        assert!(matches!(
            scheduler.tick_at(&remote, now, 12).await,
            TickOutcome::Ran(_)
        ));
        assert_eq!(
            scheduler.tick_at(&remote, now + 30_000, 12).await,
            TickOutcome::Skipped(SkipReason::TooSoon)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stays_idle_in_quiet_hours_across_midnight() {
        let settings = SyncSettings {
            quiet_hours: Some(QuietHours {
                start_hour: 22,
                end_hour: 6,
            }),
            ..SyncSettings::default()
        };
        let scheduler = scheduler_with(settings).await;
        queue_write(&scheduler).await;
        let remote = MockRemote::new();

        for hour in [22, 23, 0, 5] {
            assert_eq!(
                scheduler.tick_at(&remote, now_millis(), hour).await,
                TickOutcome::Skipped(SkipReason::QuietHours)
            );
        }
        assert!(matches!(
            scheduler.tick_at(&remote, now_millis(), 6).await,
            TickOutcome::Ran(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skips_with_empty_queue_and_fresh_checkpoint() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        let now = now_millis();
        scheduler
            .engine()
            .database()
            .set_last_sync_at(now - 1_000)
            .await
            .unwrap();
        let remote = MockRemote::new();

        assert_eq!(
            scheduler.tick_at(&remote, now, 12).await,
            TickOutcome::Skipped(SkipReason::NothingToDo)
        );
        // Overdue pull runs even with nothing queued
        let later = now + 16 * 60 * 1_000;
        assert!(matches!(
            scheduler.tick_at(&remote, later, 12).await,
            TickOutcome::Ran(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_server_skips_cycle() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        queue_write(&scheduler).await;
        let remote = MockRemote::new();
        remote.set_reachable(false);

        assert_eq!(
            scheduler.tick_at(&remote, now_millis(), 12).await,
            TickOutcome::Skipped(SkipReason::Unreachable)
        );
        assert_eq!(remote.fetch_count(), 0);
        assert_eq!(scheduler.engine().state(), SyncState::Offline);
        assert_eq!(scheduler.engine().database().queue_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_cycle_is_reported_not_raised() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        queue_write(&scheduler).await;
        let remote = MockRemote::new();
        remote.set_credential(false);

        let outcome = scheduler.tick_at(&remote, now_millis(), 12).await;
        assert!(matches!(outcome, TickOutcome::Failed(_)));
        assert_eq!(scheduler.engine().state(), SyncState::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn battery_doubles_interval_within_bounds() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let settings = SyncSettings {
            base_interval_secs: 2_000,
            max_interval_secs: 3_600,
            ..SyncSettings::default()
        };
        let engine = Arc::new(SyncEngine::new(db, settings).unwrap());

        let mains = BackgroundScheduler::new(Arc::clone(&engine));
        let battery = BackgroundScheduler::with_power_source(engine, Arc::new(Battery));

        assert_eq!(mains.current_interval(), Duration::from_secs(2_000));
        assert_eq!(battery.current_interval(), Duration::from_secs(3_600));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_is_idempotent_and_stop_ends_loop() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        queue_write(&scheduler).await;
        let remote = Arc::new(MockRemote::new());

        assert!(scheduler.start(remote.clone()).unwrap());
        assert!(!scheduler.start(remote.clone()).unwrap());
        assert!(scheduler.is_running());

        for _ in 0..100 {
            if !remote.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        scheduler.shutdown().await;

        assert!(!scheduler.is_running());
        assert_eq!(remote.sent().len(), 1);
        assert_eq!(scheduler.engine().database().queue_count().await.unwrap(), 0);
    }
    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_last_handle_ends_loop() {
        let scheduler = scheduler_with(SyncSettings::default()).await;
        let remote = Arc::new(MockRemote::new());
        assert!(scheduler.start(remote.clone()).unwrap());
        let weak = Arc::downgrade(&scheduler);

        drop(scheduler);

        for _ in 0..100 {
            if Arc::strong_count(&remote) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(weak.upgrade().is_none());
        assert_eq!(Arc::strong_count(&remote), 1);
    }
}
