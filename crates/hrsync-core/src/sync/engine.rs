//! The sync engine: owns the in-flight guard and the connection state and
//! runs pull and push passes against a [`RemoteApi`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::status::{CycleReport, SyncStatusSnapshot};
use crate::cache::ResponseCache;
use crate::config::SyncSettings;
use crate::conflict::ConflictResolver;
use crate::error::{Error, Result};
use crate::models::{HttpMethod, NewQueueEntry, QueueEntry, QueueHeaders, SyncStatus};
use crate::remote::RemoteApi;
use crate::services::DatabaseService;
use crate::state::SyncState;

/// Reconciles the local mirror and write queue with the server
pub struct SyncEngine {
    pub(super) db: DatabaseService,
    pub(super) settings: SyncSettings,
    pub(super) resolver: ConflictResolver,
    pub(super) cache: Option<ResponseCache>,
    in_flight: AtomicBool,
    state: Mutex<SyncState>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .field("in_flight", &self.is_in_flight())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag when a cycle ends, however it ends
pub(crate) struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(db: DatabaseService, settings: SyncSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            resolver: ConflictResolver::new(db.clone()),
            db,
            settings,
            cache: None,
            in_flight: AtomicBool::new(false),
            state: Mutex::new(SyncState::Offline),
        })
    }

    /// Invalidate cached GET responses when pushes change a resource.
    #[must_use]
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub const fn database(&self) -> &DatabaseService {
        &self.db
    }

    pub const fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub const fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        self.state
            .lock()
            .map_or(SyncState::Error, |state| *state)
    }

    pub(crate) fn set_state(&self, next: SyncState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                tracing::debug!("Sync state {} -> {}", *state, next);
            }
            *state = next;
        }
    }

    /// Record that the server could not be reached.
    pub fn mark_offline(&self) {
        self.set_state(SyncState::Offline);
    }

    /// Claim the single cycle slot, failing fast if a cycle is running.
    pub(crate) fn try_begin(&self) -> Result<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SyncInProgress)?;
        Ok(InFlightGuard(&self.in_flight))
    }

    /// Queue a raw request the way the UI issues it while offline.
    pub async fn queue_request(
        &self,
        method: HttpMethod,
        path: &str,
        payload: serde_json::Value,
        headers: Option<QueueHeaders>,
    ) -> Result<QueueEntry> {
        let entry = NewQueueEntry::from_request(method, path, payload, headers)?
            .with_max_retries(self.settings.default_max_retries);
        self.apply_local_write(entry).await
    }

    /// Apply a write to the mirror and queue it for push.
    ///
    /// Creates and replacements store the payload; patches merge into the
    /// existing row; deletes only mark the row pending until the server
    /// tombstone arrives.
    pub async fn apply_local_write(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        if !entry.method.is_mutating() {
            return Err(Error::InvalidOperation(format!(
                "{} requests cannot be queued",
                entry.method
            )));
        }

        let existing = self
            .db
            .find_mirror_for_server_id(entry.kind, &entry.record_id)
            .await?;
        let row_id = existing
            .as_ref()
            .map_or_else(|| entry.record_id.clone(), |row| row.id.clone());

        match entry.method {
            HttpMethod::Delete => {
                if existing.is_some() {
                    self.db
                        .set_mirror_status(entry.kind, &row_id, SyncStatus::Pending)
                        .await?;
                }
            }
            HttpMethod::Patch => {
                let merged = match existing.as_ref().map(|row| &row.data) {
                    Some(serde_json::Value::Object(current)) => {
                        let mut merged = current.clone();
                        if let serde_json::Value::Object(patch) = &entry.payload {
                            merged.extend(patch.clone());
                        }
                        serde_json::Value::Object(merged)
                    }
                    _ => entry.payload.clone(),
                };
                self.db.upsert_local(entry.kind, &row_id, &merged).await?;
            }
            _ => {
                self.db
                    .upsert_local(entry.kind, &row_id, &entry.payload)
                    .await?;
            }
        }

        let queued = self.db.enqueue(entry).await?;
        tracing::debug!(
            "Queued {} {} {} as {}",
            queued.method,
            queued.kind,
            queued.record_id,
            queued.id
        );
        Ok(queued)
    }

    /// Pull, then push. A failed pull skips the push.
    pub async fn run_cycle(&self, remote: &dyn RemoteApi) -> Result<CycleReport> {
        let _guard = self.try_begin()?;
        self.set_state(SyncState::Syncing);

        let result = async {
            let pull = self.pull_pass(remote).await?;
            let push = self.push_pass(remote).await?;
            Ok::<_, Error>(CycleReport { pull, push })
        }
        .await;
        self.finish(&result);

        if let Ok(report) = &result {
            tracing::info!(
                "Sync cycle done: pulled {} (conflicts {}), pushed {}, failed {}, dead-lettered {}",
                report.pull.total_pulled(),
                report.pull.conflicts_detected,
                report.push.pushed,
                report.push.failed,
                report.push.dead_lettered
            );
        }
        result
    }

    /// Final state for a finished cycle or standalone pass.
    pub(super) fn finish<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.set_state(SyncState::Synced),
            Err(Error::Transport(error)) if error.is_retryable() => {
                tracing::warn!("Sync failed, server unreachable: {error}");
                self.set_state(SyncState::Offline);
            }
            Err(error) => {
                tracing::error!("Sync failed: {error}");
                self.set_state(SyncState::Error);
            }
        }
    }

    /// Counts the UI can show whether or not the network is up.
    pub async fn status(&self) -> Result<SyncStatusSnapshot> {
        Ok(SyncStatusSnapshot {
            state: self.state(),
            pending_count: self.db.queue_count().await?,
            dead_letter_count: self.db.dead_letter_count().await?,
            manual_conflict_count: self.db.pending_manual_count().await?,
            last_sync_at: self.db.last_sync_at().await?,
            in_progress: self.is_in_flight(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceKind;
    use crate::sync::test_support::MockRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn engine() -> SyncEngine {
        let db = DatabaseService::open_in_memory().await.unwrap();
        SyncEngine::new(db, SyncSettings::default()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_cycle_is_rejected_while_one_runs() {
        let engine = engine().await;
        let remote = MockRemote::new();

        let guard = engine.try_begin().unwrap();
        assert!(engine.is_in_flight());
        let error = engine.run_cycle(&remote).await.unwrap_err();
        assert!(matches!(error, Error::SyncInProgress));
        assert_eq!(remote.fetch_count(), 0);

        drop(guard);
        assert!(!engine.is_in_flight());
        engine.run_cycle(&remote).await.unwrap();
        assert_eq!(engine.state(), SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_write_updates_mirror_and_queue() {
        let engine = engine().await;
        let queued = engine
            .queue_request(
                HttpMethod::Post,
                "/api/leaves",
                json!({"staff_id": "s1", "start_date": "2024-05-01", "end_date": "2024-05-02"}),
                None,
            )
            .await
            .unwrap();

        assert_eq!(queued.max_retries, engine.settings().default_max_retries);
        let row = engine
            .database()
            .get_mirror(ResourceKind::LeaveRequest, &queued.record_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_status, SyncStatus::Pending);

        let status = engine.status().await.unwrap();
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.last_sync_at, None);
        assert!(!status.in_progress);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn patch_merges_into_existing_row() {
        let engine = engine().await;
        engine
            .apply_local_write(NewQueueEntry::new(
                HttpMethod::Put,
                ResourceKind::Employee,
                "e1",
                json!({"name": "Ada", "team": "ops"}),
            ))
            .await
            .unwrap();
        engine
            .queue_request(HttpMethod::Patch, "/api/employees/e1", json!({"team": "hr"}), None)
            .await
            .unwrap();

        let row = engine
            .database()
            .get_mirror(ResourceKind::Employee, "e1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.data, json!({"name": "Ada", "team": "hr"}));
        assert_eq!(engine.database().queue_count().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_is_never_queued() {
        let engine = engine().await;
        let error = engine
            .queue_request(HttpMethod::Get, "/api/leaves", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidOperation(_)));
        assert_eq!(engine.database().queue_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_server_leaves_engine_offline() {
        let engine = engine().await;
        let remote = MockRemote::new();
        remote.fail_fetch(
            ResourceKind::Employee,
            crate::remote::TransportError::Network("connection refused".to_string()),
        );

        assert!(engine.run_cycle(&remote).await.is_err());
        assert_eq!(engine.state(), SyncState::Offline);
        assert!(!engine.is_in_flight());
    }
}
