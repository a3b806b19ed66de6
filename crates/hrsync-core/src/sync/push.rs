//! Push pass: replay queued writes in queue order.

use std::collections::HashSet;

use super::engine::SyncEngine;
use super::status::PushReport;
use crate::conflict::ConflictResolver;
use crate::db::FailureOutcome;
use crate::error::{Error, Result};
use crate::models::{
    ConflictRecord, ConflictStatus, ConflictType, HttpMethod, MirrorRecord, QueueEntry,
    ResolutionStrategy, ResourceKind, ServerRecord, SyncStatus,
};
use crate::remote::{RemoteApi, RemoteRequest, RemoteResponse, TransportError};
use crate::util::now_millis;

impl SyncEngine {
    /// Run a standalone push.
    pub async fn push(&self, remote: &dyn RemoteApi) -> Result<PushReport> {
        let _guard = self.try_begin()?;
        self.set_state(crate::state::SyncState::Syncing);
        let result = self.push_pass(remote).await;
        self.finish(&result);
        result
    }

    /// Drain one batch, fixed at the start of the pass.
    ///
    /// Entries still inside their retry backoff wait for a later pass, and so
    /// does every later entry of the same record, which keeps per-record
    /// writes in order. A 401 stops the pass without charging a retry.
    pub(super) async fn push_pass(&self, remote: &dyn RemoteApi) -> Result<PushReport> {
        if !remote.has_credential() {
            return Err(Error::Unauthenticated(
                "no credential available for push".to_string(),
            ));
        }

        let batch = self.db.queue_batch(self.settings.batch_size).await?;
        let (backoff_base, backoff_max) = self.settings.backoff_millis();
        let started_at = now_millis();
        let mut report = PushReport::default();
        let mut blocked: HashSet<(ResourceKind, String)> = HashSet::new();

        for entry in batch {
            let record = (entry.kind, entry.record_id.clone());
            if blocked.contains(&record)
                || entry.next_attempt_at(backoff_base, backoff_max) > started_at
            {
                report.skipped += 1;
                blocked.insert(record);
                continue;
            }

            let row = self
                .db
                .find_mirror_for_server_id(entry.kind, &entry.record_id)
                .await?;

            match self.send_entry(remote, &entry, row.as_ref()).await? {
                Ok(response) => {
                    self.complete_entry(&entry, row.as_ref(), response).await?;
                    report.pushed += 1;
                }
                Err(TransportError::Unauthorized(message)) => {
                    tracing::warn!("Push stopped: credential rejected");
                    return Err(Error::Unauthenticated(message));
                }
                Err(TransportError::Conflict {
                    message,
                    server_value,
                }) => {
                    self.record_rejection(&entry, row.as_ref(), &message, server_value)
                        .await?;
                    report.conflicts += 1;
                    blocked.insert(record);
                }
                Err(error) => {
                    report.failed += 1;
                    if self.record_failure(&entry, row.as_ref(), &error).await? {
                        report.dead_lettered += 1;
                    }
                    blocked.insert(record);
                }
            }
        }

        if report.conflicts > 0 {
            self.resolver.auto_resolve_conflicts().await?;
        }
        if report.pushed > 0 {
            self.db.set_last_push_at(now_millis()).await?;
        }

        tracing::info!(
            "Pushed {} queued writes ({} failed, {} dead-lettered, {} deferred)",
            report.pushed,
            report.failed,
            report.dead_lettered,
            report.skipped
        );
        Ok(report)
    }

    /// Replay one entry. The outer result carries local failures, the inner
    /// one the server's answer.
    async fn send_entry(
        &self,
        remote: &dyn RemoteApi,
        entry: &QueueEntry,
        row: Option<&MirrorRecord>,
    ) -> Result<std::result::Result<RemoteResponse, TransportError>> {
        let target = row
            .and_then(|row| row.server_id.as_deref())
            .unwrap_or(&entry.record_id);
        let path = entry.kind.endpoint(entry.method, target)?;
        let timeout = self.settings.push_timeout();
        let body = (entry.method != HttpMethod::Delete || !entry.payload.is_null())
            .then(|| entry.payload.clone());

        let request = RemoteRequest {
            method: entry.method,
            path,
            body,
            headers: entry.headers.clone().unwrap_or_default(),
            timeout,
        };
        tracing::debug!("Replaying {} {} ({})", request.method, request.path, entry.id);

        Ok(tokio::time::timeout(timeout, remote.send(request))
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout))))
    }

    /// Dequeue a confirmed write, then record the server identity on its row.
    async fn complete_entry(
        &self,
        entry: &QueueEntry,
        row: Option<&MirrorRecord>,
        response: RemoteResponse,
    ) -> Result<()> {
        self.db.dequeue(&entry.id).await?;

        if let Some(row) = row {
            let server = response
                .body
                .and_then(|body| response_record(entry.kind, body));
            let server_id = server
                .as_ref()
                .map(|record| record.id.clone())
                .or_else(|| (entry.method != HttpMethod::Post).then(|| entry.record_id.clone()));
            let server_updated_at = server.as_ref().and_then(|record| record.updated_at);

            let status = self
                .db
                .mark_pushed(row.kind, &row.id, server_id.as_deref(), server_updated_at)
                .await?;
            if status == SyncStatus::Pending {
                tracing::debug!("{} {} still has queued writes", row.kind, row.id);
            }
        }

        if let Some(cache) = &self.cache {
            if let Err(error) = cache.invalidate_resource(entry.kind.collection_path()).await {
                tracing::warn!("Failed to invalidate cache for {}: {error}", entry.kind);
            }
        }
        Ok(())
    }

    /// The server refused the write as conflicting. The entry leaves the
    /// queue and the disagreement is stored for the resolver.
    async fn record_rejection(
        &self,
        entry: &QueueEntry,
        row: Option<&MirrorRecord>,
        message: &str,
        server_value: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = now_millis();
        let server = server_value
            .clone()
            .and_then(|value| ServerRecord::from_json(entry.kind, value).ok());

        let classified = match (row, &server) {
            (Some(row), Some(server)) => ConflictResolver::classify(
                std::slice::from_ref(row),
                std::slice::from_ref(server),
                now,
            ),
            _ => Vec::new(),
        };

        let conflicts = if classified.is_empty() {
            vec![ConflictRecord {
                id: 0,
                kind: entry.kind,
                entity_id: row.map_or_else(|| entry.record_id.clone(), |row| row.id.clone()),
                local_value: row.map_or_else(|| entry.payload.clone(), |row| row.data.clone()),
                server_value,
                server_id: server
                    .as_ref()
                    .map(|record| record.id.clone())
                    .or_else(|| row.and_then(|row| row.server_id.clone())),
                server_updated_at: server.as_ref().and_then(|record| record.updated_at),
                conflict_type: ConflictType::WriteRejected,
                strategy: ResolutionStrategy::Manual,
                explanation: format!(
                    "Server rejected {} {}: {message}",
                    entry.method, entry.record_id
                ),
                status: ConflictStatus::Pending,
                detected_at: now,
                resolved_at: None,
            }]
        } else {
            classified
        };

        for conflict in &conflicts {
            self.db.insert_conflict(conflict).await?;
            if row.is_some() {
                self.db
                    .set_mirror_status(conflict.kind, &conflict.entity_id, SyncStatus::Conflict)
                    .await?;
            }
            tracing::warn!("{}", conflict.explanation);
        }
        self.db.dequeue(&entry.id).await?;
        Ok(())
    }

    /// Charge a failed attempt. Returns whether the entry was quarantined.
    async fn record_failure(
        &self,
        entry: &QueueEntry,
        row: Option<&MirrorRecord>,
        error: &TransportError,
    ) -> Result<bool> {
        match self.db.record_queue_failure(&entry.id, &error.to_string()).await? {
            FailureOutcome::Retrying {
                retries,
                max_retries,
            } => {
                tracing::warn!(
                    "Push of {} {} failed (attempt {retries}/{max_retries}): {error}",
                    entry.method,
                    entry.record_id
                );
                Ok(false)
            }
            FailureOutcome::DeadLettered { retries } => {
                tracing::error!(
                    "Push of {} {} dead-lettered after {retries} attempts: {error}",
                    entry.method,
                    entry.record_id
                );
                if let Some(row) = row {
                    self.db
                        .set_mirror_status(row.kind, &row.id, SyncStatus::Error)
                        .await?;
                }
                Ok(true)
            }
        }
    }
}

/// The record a write response describes, bare or under `data`.
fn response_record(kind: ResourceKind, body: serde_json::Value) -> Option<ServerRecord> {
    let body = match body {
        serde_json::Value::Object(mut object)
            if object.get("data").is_some_and(serde_json::Value::is_object) =>
        {
            object.remove("data")?
        }
        other => other,
    };
    ServerRecord::from_json(kind, body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::models::NewQueueEntry;
    use crate::services::DatabaseService;
    use crate::sync::test_support::MockRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn engine_with(settings: SyncSettings) -> SyncEngine {
        let db = DatabaseService::open_in_memory().await.unwrap();
        SyncEngine::new(db, settings).unwrap()
    }

    fn no_backoff() -> SyncSettings {
        SyncSettings {
            retry_backoff_base_secs: 0,
            ..SyncSettings::default()
        }
    }

    fn queued(kind: ResourceKind, id: &str, priority: i64, created_at: i64) -> QueueEntry {
        NewQueueEntry::new(HttpMethod::Put, kind, id, json!({"id": id}))
            .with_priority(priority)
            .into_entry(created_at)
    }

    fn server_error() -> TransportError {
        TransportError::Status {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_queue_in_priority_then_age_order() {
        let engine = engine_with(no_backoff()).await;
        let db = engine.database();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "a", 1, 1_000)).await.unwrap();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "b", 5, 2_000)).await.unwrap();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "c", 1, 3_000)).await.unwrap();
        let remote = MockRemote::new();

        let report = engine.push(&remote).await.unwrap();

        assert_eq!(report.pushed, 3);
        assert_eq!(
            remote.sent_paths(),
            vec!["/api/employees/b", "/api/employees/a", "/api/employees/c"]
        );
        assert_eq!(db.queue_count().await.unwrap(), 0);
        assert!(db.last_push_at().await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_local_write_reaches_the_server_once() {
        let engine = engine_with(no_backoff()).await;
        for n in 0..5 {
            engine
                .queue_request(
                    HttpMethod::Post,
                    "/api/leaves",
                    json!({
                        "staff_id": format!("s{n}"),
                        "start_date": "2024-06-01",
                        "end_date": "2024-06-02"
                    }),
                    None,
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let remote = MockRemote::new();

        engine.push(&remote).await.unwrap();
        engine.push(&remote).await.unwrap();

        let sent = remote.sent();
        assert_eq!(sent.len(), 5);
        let staff = sent
            .iter()
            .map(|request| request.body.as_ref().unwrap()["staff_id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(staff, vec!["s0", "s1", "s2", "s3", "s4"]);
        assert_eq!(
            engine.database().count_mirror_by_status(SyncStatus::Synced).await.unwrap(),
            5
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn created_record_takes_server_id_for_later_writes() {
        let engine = engine_with(no_backoff()).await;
        let created = engine
            .queue_request(
                HttpMethod::Post,
                "/api/leaves",
                json!({"staff_id": "s1", "start_date": "2024-06-01", "end_date": "2024-06-02"}),
                None,
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        engine
            .apply_local_write(NewQueueEntry::new(
                HttpMethod::Patch,
                ResourceKind::LeaveRequest,
                created.record_id.clone(),
                json!({"end_date": "2024-06-03"}),
            ))
            .await
            .unwrap();
        let remote = MockRemote::new();

        engine.push(&remote).await.unwrap();

        let paths = remote.sent_paths();
        assert_eq!(paths[0], "/api/leaves");
        assert_eq!(paths[1], "/api/leaves/srv-1");
        let row = engine
            .database()
            .get_mirror(ResourceKind::LeaveRequest, &created.record_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.server_id.as_deref(), Some("srv-1"));
        assert_eq!(row.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_entry_is_quarantined_after_max_retries() {
        let engine = engine_with(no_backoff()).await;
        let db = engine.database();
        let entry =
            NewQueueEntry::new(HttpMethod::Delete, ResourceKind::LeaveRequest, "d", json!(null))
                .with_max_retries(3);
        let entry = db.enqueue(entry).await.unwrap();
        let remote = MockRemote::new();
        remote.fail_sends(server_error());

        let first = engine.push(&remote).await.unwrap();
        let second = engine.push(&remote).await.unwrap();
        assert_eq!((first.failed, first.dead_lettered), (1, 0));
        assert_eq!((second.failed, second.dead_lettered), (1, 0));
        assert_eq!(db.get_queue_entry(&entry.id).await.unwrap().unwrap().retries, 2);

        let third = engine.push(&remote).await.unwrap();
        assert_eq!(third.dead_lettered, 1);
        assert_eq!(db.queue_count().await.unwrap(), 0);
        let dead = db.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].entry.id, entry.id);
        assert_eq!(dead[0].retry_count, 3);

        let fourth = engine.push(&remote).await.unwrap();
        assert_eq!(fourth, PushReport::default());
        assert_eq!(remote.sent().len(), 3);
        assert_eq!(remote.sent()[0].body, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backoff_defers_recent_failures() {
        let engine = engine_with(SyncSettings::default()).await;
        engine
            .database()
            .insert_queue_entry(&queued(ResourceKind::Employee, "e1", 0, 1))
            .await
            .unwrap();
        let remote = MockRemote::new();
        remote.fail_sends(server_error());

        let first = engine.push(&remote).await.unwrap();
        let second = engine.push(&remote).await.unwrap();

        assert_eq!(first.failed, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(remote.sent().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn later_write_waits_for_earlier_write_of_same_record() {
        let engine = engine_with(no_backoff()).await;
        let db = engine.database();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "e1", 0, 1)).await.unwrap();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "e1", 0, 2)).await.unwrap();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "e2", 0, 3)).await.unwrap();
        let remote = MockRemote::new();
        remote.fail_path("/api/employees/e1", server_error());

        let report = engine.push(&remote).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(
            remote.sent_paths(),
            vec!["/api/employees/e1", "/api/employees/e2"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn row_stays_pending_while_later_writes_are_queued() {
        let engine = engine_with(no_backoff()).await;
        let db = engine.database();
        let remote = MockRemote::new();
        let pulled_at = now_millis() - 60_000;
        remote.set_records(
            ResourceKind::Employee,
            vec![json!({"id": "e1", "name": "Ana", "team": "ops", "updated_at": pulled_at})],
        );
        engine.pull(&remote).await.unwrap();

        for patch in [json!({"name": "Ana B"}), json!({"team": "hr"})] {
            engine
                .apply_local_write(NewQueueEntry::new(
                    HttpMethod::Patch,
                    ResourceKind::Employee,
                    "e1",
                    patch,
                ))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        remote.stamp_responses(now_millis());
        remote.fail_send_number(2, server_error());

        let report = engine.push(&remote).await.unwrap();

        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(db.queue_count().await.unwrap(), 1);
        let row = db.get_mirror(ResourceKind::Employee, "e1").await.unwrap().unwrap();
        assert_eq!(row.sync_status, SyncStatus::Pending);
        assert!(row.has_local_edits());

        // The server moves on; its value must beat the write still queued
        remote.set_records(
            ResourceKind::Employee,
            vec![json!({
                "id": "e1",
                "name": "Ana",
                "team": "finance",
                "updated_at": now_millis() + 60_000
            })],
        );
        let pulled = engine.pull(&remote).await.unwrap();

        assert!(pulled.conflicts_detected >= 1);
        assert_eq!(db.queue_count().await.unwrap(), 0);
        let row = db.get_mirror(ResourceKind::Employee, "e1").await.unwrap().unwrap();
        assert_eq!(row.data["team"], json!("finance"));
        assert_eq!(row.sync_status, SyncStatus::Synced);

        engine.push(&remote).await.unwrap();
        assert_eq!(remote.sent().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn row_is_synced_once_its_last_write_lands() {
        let engine = engine_with(no_backoff()).await;
        let db = engine.database();
        for patch in [json!({"name": "Ana B"}), json!({"team": "hr"})] {
            engine
                .apply_local_write(NewQueueEntry::new(
                    HttpMethod::Put,
                    ResourceKind::Employee,
                    "e7",
                    patch,
                ))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let remote = MockRemote::new();

        let report = engine.push(&remote).await.unwrap();

        assert_eq!(report.pushed, 2);
        let row = db.get_mirror(ResourceKind::Employee, "e7").await.unwrap().unwrap();
        assert_eq!(row.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthorized_stops_push_without_charging_retries() {
        let engine = engine_with(no_backoff()).await;
        let db = engine.database();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "e1", 0, 1)).await.unwrap();
        db.insert_queue_entry(&queued(ResourceKind::Employee, "e2", 0, 2)).await.unwrap();
        let remote = MockRemote::new();
        remote.fail_sends(TransportError::Unauthorized("expired".to_string()));

        let error = engine.push(&remote).await.unwrap_err();

        assert!(matches!(error, Error::Unauthenticated(_)));
        assert_eq!(remote.sent().len(), 1);
        let queue = db.list_queue().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|entry| entry.retries == 0));
        assert_eq!(engine.state(), crate::state::SyncState::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_write_becomes_manual_conflict() {
        let engine = engine_with(no_backoff()).await;
        engine
            .apply_local_write(NewQueueEntry::new(
                HttpMethod::Put,
                ResourceKind::LeaveRequest,
                "91",
                json!({"staff_id": "s1", "start_date": "2024-06-01", "end_date": "2024-06-02"}),
            ))
            .await
            .unwrap();
        let remote = MockRemote::new();
        remote.fail_sends(TransportError::Conflict {
            message: "overlapping request".to_string(),
            server_value: None,
        });

        let report = engine.push(&remote).await.unwrap();

        assert_eq!(report.conflicts, 1);
        let db = engine.database();
        assert_eq!(db.queue_count().await.unwrap(), 0);
        let manual = db.pending_manual_conflicts().await.unwrap();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].conflict_type, ConflictType::WriteRejected);
        assert_eq!(manual[0].entity_id, "91");
        let row = db.get_mirror(ResourceKind::LeaveRequest, "91").await.unwrap().unwrap();
        assert_eq!(row.sync_status, SyncStatus::Conflict);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_write_with_final_server_state_resolves_to_server() {
        let engine = engine_with(no_backoff()).await;
        engine
            .apply_local_write(NewQueueEntry::new(
                HttpMethod::Put,
                ResourceKind::LeaveRequest,
                "91",
                json!({
                    "staff_id": "s1",
                    "start_date": "2024-06-01",
                    "end_date": "2024-06-02",
                    "status": "pending"
                }),
            ))
            .await
            .unwrap();
        let remote = MockRemote::new();
        remote.fail_sends(TransportError::Conflict {
            message: "already decided".to_string(),
            server_value: Some(json!({
                "id": "91",
                "staff_id": "s1",
                "start_date": "2024-06-01",
                "end_date": "2024-06-02",
                "status": "rejected"
            })),
        });

        engine.push(&remote).await.unwrap();

        let db = engine.database();
        assert_eq!(db.pending_manual_count().await.unwrap(), 0);
        let row = db.get_mirror(ResourceKind::LeaveRequest, "91").await.unwrap().unwrap();
        assert_eq!(row.data["status"], "rejected");
        assert_eq!(row.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn response_record_accepts_wrapped_body() {
        let record = response_record(
            ResourceKind::Employee,
            json!({"data": {"id": "e9", "name": "Lin"}}),
        )
        .unwrap();
        assert_eq!(record.id, "e9");
        assert!(response_record(ResourceKind::Employee, json!({"ok": true})).is_none());
    }
}
