//! Shared database service wrapper used by the engine, the scheduler and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{
    Database, FailureOutcome, LibSqlCacheRepository, LibSqlConflictRepository,
    LibSqlDeadLetterRepository, LibSqlMetadataRepository, LibSqlMirrorRepository,
    LibSqlQueueRepository, MirrorRepository, QueueRepository, UpsertOutcome, LAST_PUSH_AT,
    LAST_SYNC_AT,
};
use crate::models::{
    CacheEntry, ConflictRecord, DeadLetterEntry, HttpMethod, MirrorRecord, NewQueueEntry,
    QueueEntry, QueueEntryId, QueueHeaders, ResolutionStrategy, ResourceKind, ServerRecord,
    SyncStatus,
};
use crate::util::now_millis;
use crate::Result;

/// Thread-safe service for DB and repository operations.
///
/// Every repository call goes through one mutex, which makes this the single
/// writer for the queue, dead letters, mirror rows and the checkpoint.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_file(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, when file-backed
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_file(db_path: &Path) -> Result<()> {
        if !db_path.exists() {
            return Ok(());
        }
        let backup_name = format!("hrsync.db.corrupt-{}", now_millis());
        let backup_path = db_path.with_file_name(backup_name);
        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted local DB file from {} to {}",
            db_path.display(),
            backup_path.display()
        );
        Ok(())
    }

    // Write queue

    /// Queue a raw mutating request. GET and unknown paths are rejected.
    pub async fn enqueue_request(
        &self,
        method: HttpMethod,
        path: &str,
        payload: serde_json::Value,
        headers: Option<QueueHeaders>,
    ) -> Result<QueueEntryId> {
        let entry = NewQueueEntry::from_request(method, path, payload, headers)?;
        Ok(self.enqueue(entry).await?.id)
    }

    /// Queue a write stamped with the current time.
    pub async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        let entry = entry.into_entry(now_millis());
        self.insert_queue_entry(&entry).await?;
        Ok(entry)
    }

    /// Store a fully built queue entry.
    pub async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.insert(entry).await?;
        tracing::debug!(
            "Queued {} {} {} ({})",
            entry.method,
            entry.kind,
            entry.record_id,
            entry.id
        );
        Ok(())
    }

    /// List queued writes in replay order.
    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).list().await
    }

    /// First `limit` queued writes in replay order.
    pub async fn queue_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .list_batch(limit)
            .await
    }

    pub async fn get_queue_entry(&self, id: &QueueEntryId) -> Result<Option<QueueEntry>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).get(id).await
    }

    /// Remove a queued write.
    pub async fn dequeue(&self, id: &QueueEntryId) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .dequeue(id)
            .await
    }

    /// Drop every queued write.
    pub async fn clear_queue(&self) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).clear().await
    }

    pub async fn queue_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).count().await
    }

    /// Charge one failed attempt; may quarantine the entry.
    pub async fn record_queue_failure(
        &self,
        id: &QueueEntryId,
        error: &str,
    ) -> Result<FailureOutcome> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .record_failure(id, error, now_millis())
            .await
    }

    /// Drop queued writes targeting one record.
    pub async fn remove_queued_for_record(
        &self,
        kind: ResourceKind,
        record_id: &str,
    ) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .remove_for_record(kind, record_id)
            .await
    }

    // Dead letters

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let db = self.db.lock().await;
        LibSqlDeadLetterRepository::new(db.connection())
            .list(limit)
            .await
    }

    pub async fn dead_letter_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlDeadLetterRepository::new(db.connection())
            .count()
            .await
    }

    /// Operator action: give a dead letter another full retry budget.
    pub async fn requeue_dead_letter(&self, id: &QueueEntryId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlDeadLetterRepository::new(db.connection())
            .requeue(id)
            .await?;
        tracing::info!("Requeued dead letter {id}");
        Ok(())
    }

    pub async fn purge_dead_letter(&self, id: &QueueEntryId) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlDeadLetterRepository::new(db.connection())
            .purge(id)
            .await
    }

    pub async fn clear_dead_letters(&self) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlDeadLetterRepository::new(db.connection())
            .clear()
            .await
    }

    // Mirror rows

    pub async fn get_mirror(&self, kind: ResourceKind, id: &str) -> Result<Option<MirrorRecord>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .get(kind, id)
            .await
    }

    pub async fn find_mirror_for_server_id(
        &self,
        kind: ResourceKind,
        server_id: &str,
    ) -> Result<Option<MirrorRecord>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .find_for_server_id(kind, server_id)
            .await
    }

    pub async fn list_mirror(&self, kind: ResourceKind) -> Result<Vec<MirrorRecord>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .list(kind)
            .await
    }

    pub async fn list_mirror_by_status(&self, status: SyncStatus) -> Result<Vec<MirrorRecord>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .list_by_status(status)
            .await
    }

    pub async fn count_mirror_by_status(&self, status: SyncStatus) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .count_by_status(status)
            .await
    }

    /// Apply a pulled record (last-pull-wins).
    pub async fn upsert_from_server(&self, record: &ServerRecord) -> Result<UpsertOutcome> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .upsert_from_server(record, now_millis())
            .await
    }

    /// Record local fields for a row awaiting push.
    pub async fn upsert_local(
        &self,
        kind: ResourceKind,
        id: &str,
        data: &serde_json::Value,
    ) -> Result<MirrorRecord> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .upsert_local(kind, id, data, now_millis())
            .await
    }

    /// Confirm a pushed write. The row only becomes `synced` once no other
    /// write of it is queued under its local or server id; until then it
    /// stays `pending`. Returns the status written.
    pub async fn mark_pushed(
        &self,
        kind: ResourceKind,
        id: &str,
        server_id: Option<&str>,
        server_updated_at: Option<i64>,
    ) -> Result<SyncStatus> {
        let db = self.db.lock().await;
        let mirror = LibSqlMirrorRepository::new(db.connection());
        let queue = LibSqlQueueRepository::new(db.connection());

        let known_server_id = mirror.get(kind, id).await?.and_then(|row| row.server_id);
        let mut record_ids = vec![id];
        for other in [server_id, known_server_id.as_deref()].into_iter().flatten() {
            if !record_ids.contains(&other) {
                record_ids.push(other);
            }
        }

        let mut still_queued = 0;
        for record_id in record_ids {
            still_queued += queue.count_for_record(kind, record_id).await?;
        }
        let status = if still_queued == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        };

        mirror
            .mark_pushed(kind, id, server_id, server_updated_at, status, now_millis())
            .await?;
        Ok(status)
    }

    pub async fn apply_server_value(
        &self,
        kind: ResourceKind,
        id: &str,
        server_id: Option<&str>,
        data: &serde_json::Value,
        server_updated_at: Option<i64>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .apply_server_value(kind, id, server_id, data, server_updated_at, now_millis())
            .await
    }

    pub async fn set_mirror_status(
        &self,
        kind: ResourceKind,
        id: &str,
        status: SyncStatus,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .set_status(kind, id, status, now_millis())
            .await
    }

    pub async fn delete_mirror(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .delete(kind, id)
            .await
    }

    // Conflicts

    pub async fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<i64> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .insert(conflict)
            .await
    }

    pub async fn get_conflict(&self, id: i64) -> Result<Option<ConflictRecord>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .get(id)
            .await
    }

    pub async fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_pending()
            .await
    }

    /// Conflicts awaiting an operator decision.
    pub async fn pending_manual_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_pending_manual()
            .await
    }

    pub async fn pending_manual_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .count_pending_manual()
            .await
    }

    pub async fn recent_conflicts(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_recent(limit)
            .await
    }

    pub async fn mark_conflict_resolved(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .mark_resolved(id, strategy, now_millis())
            .await
    }

    // Response cache

    pub async fn cache_get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let db = self.db.lock().await;
        LibSqlCacheRepository::new(db.connection()).get(key).await
    }

    pub async fn cache_put(&self, entry: &CacheEntry) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlCacheRepository::new(db.connection()).put(entry).await
    }

    pub async fn cache_delete(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlCacheRepository::new(db.connection())
            .delete(key)
            .await
    }

    pub async fn cache_delete_path(&self, path: &str) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlCacheRepository::new(db.connection())
            .delete_path_prefix(path)
            .await
    }

    pub async fn cache_clear(&self) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlCacheRepository::new(db.connection()).clear().await
    }

    // Sync metadata

    /// Checkpoint of the last fully successful pull.
    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .get_millis(LAST_SYNC_AT)
            .await
    }

    pub async fn set_last_sync_at(&self, millis: i64) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .set_millis(LAST_SYNC_AT, millis, now_millis())
            .await
    }

    pub async fn last_push_at(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .get_millis(LAST_PUSH_AT)
            .await
    }

    pub async fn set_last_push_at(&self, millis: i64) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .set_millis(LAST_PUSH_AT, millis, now_millis())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_request_is_visible_in_queue() {
        let service = DatabaseService::open_in_memory().await.unwrap();

        let id = service
            .enqueue_request(
                HttpMethod::Post,
                "/api/leaves",
                json!({ "staff_id": "S1" }),
                None,
            )
            .await
            .unwrap();

        let queue = service.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, id);
        assert_eq!(queue[0].kind, ResourceKind::LeaveRequest);
        assert_eq!(service.queue_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_request_rejects_get() {
        let service = DatabaseService::open_in_memory().await.unwrap();

        let result = service
            .enqueue_request(HttpMethod::Get, "/api/leaves", json!({}), None)
            .await;
        assert!(matches!(result, Err(crate::Error::InvalidOperation(_))));
        assert_eq!(service.queue_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_survives_restart() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("data").join("hrsync.db");

        {
            let service = DatabaseService::open_path(&path).await.unwrap();
            service
                .enqueue_request(HttpMethod::Delete, "/api/leaves/9", json!({}), None)
                .await
                .unwrap();
        }

        let service = DatabaseService::open_path(&path).await.unwrap();
        let queue = service.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].record_id, "9");
        assert_eq!(service.path(), Some(path.as_path()));
    }

    #[test]
    fn detects_corrupted_db_errors() {
        assert!(DatabaseService::is_corrupted_db_error(
            &crate::Error::Database("SQLite failure: file is not a database".to_string())
        ));
        assert!(!DatabaseService::is_corrupted_db_error(
            &crate::Error::InvalidInput("bad".to_string())
        ));
    }
}
