//! Pull pass: fetch server changes since the checkpoint and fold them into
//! the mirror.

use std::collections::HashSet;

use super::engine::SyncEngine;
use super::status::PullReport;
use crate::conflict::ConflictResolver;
use crate::db::UpsertOutcome;
use crate::error::{Error, Result};
use crate::models::{ConflictType, MirrorRecord, ResourceKind, ServerRecord, SyncStatus};
use crate::remote::{RemoteApi, TransportError};
use crate::util::now_millis;

impl SyncEngine {
    /// Run a standalone pull.
    pub async fn pull(&self, remote: &dyn RemoteApi) -> Result<PullReport> {
        let _guard = self.try_begin()?;
        self.set_state(crate::state::SyncState::Syncing);
        let result = self.pull_pass(remote).await;
        self.finish(&result);
        result
    }

    /// Fetch every kind first, then apply. The checkpoint only moves when
    /// the whole pass succeeds, and it moves to the time the pass started so
    /// records changed during the pass are fetched again next time.
    pub(super) async fn pull_pass(&self, remote: &dyn RemoteApi) -> Result<PullReport> {
        if !remote.has_credential() {
            return Err(Error::Unauthenticated(
                "no credential available for pull".to_string(),
            ));
        }

        let started_at = now_millis();
        let since = self.db.last_sync_at().await?;
        let timeout = self.settings.pull_timeout();

        let mut fetched = Vec::with_capacity(ResourceKind::ALL.len());
        for kind in ResourceKind::ALL {
            let records = tokio::time::timeout(timeout, remote.fetch_since(kind, since, timeout))
                .await
                .map_err(|_| TransportError::Timeout(timeout))?
                .map_err(|error| match error {
                    TransportError::Unauthorized(message) => Error::Unauthenticated(message),
                    other => Error::Transport(other),
                })?;
            let records = records
                .into_iter()
                .map(|value| ServerRecord::from_json(kind, value))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!("Fetched {} {kind} records", records.len());
            fetched.push((kind, records));
        }

        let mut report = PullReport::default();
        for (kind, records) in fetched {
            self.apply_pulled(kind, records, &mut report).await?;
        }

        report.conflicts_resolved = self.resolver.auto_resolve_conflicts().await?;
        self.db.set_last_sync_at(started_at).await?;

        tracing::info!(
            "Pulled {} records ({} tombstones, {} conflicts)",
            report.total_pulled(),
            report.tombstones_applied,
            report.conflicts_detected
        );
        Ok(report)
    }

    async fn apply_pulled(
        &self,
        kind: ResourceKind,
        records: Vec<ServerRecord>,
        report: &mut PullReport,
    ) -> Result<()> {
        let local = self.db.list_mirror(kind).await?;
        let now = now_millis();

        // Matched rows with a conflict are left to the resolver; duplicates
        // only concern the local copy, so the server record is still stored.
        let mut held_back = HashSet::new();
        for conflict in ConflictResolver::classify(&local, &records, now) {
            if conflict.conflict_type != ConflictType::DuplicateSubmission {
                held_back.extend(conflict.server_id.clone());
            }
            self.db.insert_conflict(&conflict).await?;
            self.db
                .set_mirror_status(kind, &conflict.entity_id, SyncStatus::Conflict)
                .await?;
            report.conflicts_detected += 1;
            tracing::warn!("{}", conflict.explanation);
        }

        let mut pulled = 0;
        for record in records {
            if record.deleted {
                if self.apply_tombstone(&local, &record).await? {
                    report.tombstones_applied += 1;
                }
                continue;
            }
            pulled += 1;

            if held_back.contains(&record.id) || awaiting_operator(&local, &record) {
                continue;
            }
            if self.db.upsert_from_server(&record).await? == UpsertOutcome::Inserted {
                tracing::debug!("New {kind} {} from server", record.id);
            }
        }

        match kind {
            ResourceKind::Employee => report.employees_pulled += pulled,
            ResourceKind::LeaveBalance => report.balances_pulled += pulled,
            ResourceKind::LeaveRequest => report.leave_requests_pulled += pulled,
        }
        Ok(())
    }

    /// Hard-delete the mirror row a tombstone names, with any writes still
    /// queued for it.
    async fn apply_tombstone(&self, local: &[MirrorRecord], record: &ServerRecord) -> Result<bool> {
        let Some(row) = find_local(local, record) else {
            return Ok(false);
        };

        let mut dropped = self
            .db
            .remove_queued_for_record(row.kind, &row.id)
            .await?;
        if row.id != record.id {
            dropped += self
                .db
                .remove_queued_for_record(row.kind, &record.id)
                .await?;
        }
        if dropped > 0 {
            tracing::warn!(
                "Dropped {dropped} queued writes for {} {} deleted on the server",
                row.kind,
                row.id
            );
        }
        self.db.delete_mirror(row.kind, &row.id).await
    }
}

fn find_local<'a>(local: &'a [MirrorRecord], record: &ServerRecord) -> Option<&'a MirrorRecord> {
    local
        .iter()
        .find(|row| row.server_id.as_deref() == Some(record.id.as_str()))
        .or_else(|| local.iter().find(|row| row.id == record.id))
}

/// Rows parked in `conflict` keep their local value until resolved.
fn awaiting_operator(local: &[MirrorRecord], record: &ServerRecord) -> bool {
    find_local(local, record).is_some_and(|row| row.sync_status == SyncStatus::Conflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::models::{ConflictStatus, HttpMethod, NewQueueEntry, ResolutionStrategy};
    use crate::services::DatabaseService;
    use crate::sync::test_support::MockRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn engine() -> SyncEngine {
        let db = DatabaseService::open_in_memory().await.unwrap();
        SyncEngine::new(db, SyncSettings::default()).unwrap()
    }

    fn leave(id: &str, staff: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "staff_id": staff,
            "start_date": "2024-05-01",
            "end_date": "2024-05-03",
            "status": status,
            "updated_at": "2024-04-20T10:00:00Z"
        })
    }

    fn seeded_remote() -> MockRemote {
        let remote = MockRemote::new();
        remote.set_records(
            ResourceKind::Employee,
            vec![
                json!({"id": "e1", "name": "Ada", "updated_at": "2024-04-01T00:00:00Z"}),
                json!({"id": "e2", "name": "Grace", "updated_at": "2024-04-02T00:00:00Z"}),
            ],
        );
        remote.set_records(
            ResourceKind::LeaveBalance,
            vec![json!({"id": "b1", "staff_id": "e1", "days": 12})],
        );
        remote.set_records(
            ResourceKind::LeaveRequest,
            vec![leave("91", "e1", "pending")],
        );
        remote
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_mirrors_every_kind_and_sets_checkpoint() {
        let engine = engine().await;
        let remote = seeded_remote();
        let before = now_millis();

        let report = engine.pull(&remote).await.unwrap();

        assert_eq!(report.employees_pulled, 2);
        assert_eq!(report.balances_pulled, 1);
        assert_eq!(report.leave_requests_pulled, 1);
        assert_eq!(report.conflicts_detected, 0);
        let checkpoint = engine.database().last_sync_at().await.unwrap().unwrap();
        assert!(checkpoint >= before);
        assert_eq!(
            engine.database().count_mirror_by_status(SyncStatus::Synced).await.unwrap(),
            4
        );
        assert_eq!(remote.fetches()[0], (ResourceKind::Employee, None));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_pull_leaves_mirror_unchanged() {
        let engine = engine().await;
        let remote = seeded_remote();

        engine.pull(&remote).await.unwrap();
        let first = engine.database().list_mirror(ResourceKind::Employee).await.unwrap();
        let report = engine.pull(&remote).await.unwrap();
        let second = engine.database().list_mirror(ResourceKind::Employee).await.unwrap();

        assert_eq!(report.conflicts_detected, 0);
        assert_eq!(first, second);
        let since = remote.fetches().last().unwrap().1;
        assert!(since.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_fetch_keeps_checkpoint() {
        let engine = engine().await;
        let remote = seeded_remote();
        engine.pull(&remote).await.unwrap();
        let checkpoint = engine.database().last_sync_at().await.unwrap();

        remote.fail_fetch(
            ResourceKind::LeaveRequest,
            TransportError::Status {
                status: 500,
                message: "boom".to_string(),
            },
        );
        assert!(engine.pull(&remote).await.is_err());
        assert_eq!(engine.database().last_sync_at().await.unwrap(), checkpoint);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_without_credential_is_unauthenticated() {
        let engine = engine().await;
        let remote = seeded_remote();
        remote.set_credential(false);

        let error = engine.pull(&remote).await.unwrap_err();
        assert!(matches!(error, Error::Unauthenticated(_)));
        assert_eq!(remote.fetch_count(), 0);
        assert_eq!(engine.database().last_sync_at().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthorized_fetch_is_unauthenticated() {
        let engine = engine().await;
        let remote = seeded_remote();
        remote.fail_fetch(
            ResourceKind::Employee,
            TransportError::Unauthorized("token expired".to_string()),
        );

        let error = engine.pull(&remote).await.unwrap_err();
        assert!(matches!(error, Error::Unauthenticated(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_approval_overrides_local_edit() {
        let engine = engine().await;
        let remote = seeded_remote();
        engine.pull(&remote).await.unwrap();

        engine
            .apply_local_write(NewQueueEntry::new(
                HttpMethod::Put,
                ResourceKind::LeaveRequest,
                "91",
                json!({
                    "staff_id": "e1",
                    "start_date": "2024-05-01",
                    "end_date": "2024-05-04",
                    "status": "pending"
                }),
            ))
            .await
            .unwrap();
        remote.set_records(ResourceKind::LeaveRequest, vec![leave("91", "e1", "approved")]);

        let report = engine.pull(&remote).await.unwrap();

        assert_eq!(report.conflicts_detected, 1);
        assert_eq!(report.conflicts_resolved, 1);
        let row = engine
            .database()
            .get_mirror(ResourceKind::LeaveRequest, "91")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.data["status"], "approved");
        assert_eq!(row.sync_status, SyncStatus::Synced);
        // The superseded edit must not be pushed
        assert_eq!(engine.database().queue_count().await.unwrap(), 0);

        let recent = engine.database().recent_conflicts(10).await.unwrap();
        assert_eq!(recent[0].conflict_type, ConflictType::Approval);
        assert_eq!(recent[0].strategy, ResolutionStrategy::ServerWins);
        assert_eq!(recent[0].status, ConflictStatus::Resolved);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_duplicate_of_server_request_is_discarded() {
        let engine = engine().await;
        let remote = MockRemote::new();
        let local = engine
            .queue_request(
                HttpMethod::Post,
                "/api/leaves",
                json!({
                    "staff_id": "e1",
                    "start_date": "2024-05-01",
                    "end_date": "2024-05-03",
                    "status": "pending"
                }),
                None,
            )
            .await
            .unwrap();
        remote.set_records(ResourceKind::LeaveRequest, vec![leave("91", "e1", "pending")]);

        let report = engine.pull(&remote).await.unwrap();

        assert_eq!(report.conflicts_detected, 1);
        let rows = engine.database().list_mirror(ResourceKind::LeaveRequest).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "91");
        assert!(engine
            .database()
            .get_queue_entry(&local.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_deletes_row_and_queued_writes() {
        let engine = engine().await;
        let remote = seeded_remote();
        engine.pull(&remote).await.unwrap();
        engine
            .queue_request(HttpMethod::Patch, "/api/employees/e2", json!({"name": "G"}), None)
            .await
            .unwrap();

        remote.set_records(
            ResourceKind::Employee,
            vec![json!({"id": "e2", "deleted": true})],
        );
        let report = engine.pull(&remote).await.unwrap();

        assert_eq!(report.tombstones_applied, 1);
        assert!(engine
            .database()
            .get_mirror(ResourceKind::Employee, "e2")
            .await
            .unwrap()
            .is_none());
        assert_eq!(engine.database().queue_count().await.unwrap(), 0);
    }
}
