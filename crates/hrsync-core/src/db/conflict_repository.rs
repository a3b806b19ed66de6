//! Conflict log repository

#![allow(clippy::cast_possible_wrap)]

use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{ConflictRecord, ConflictStatus, ResolutionStrategy};

const CONFLICT_COLUMNS: &str = "id, kind, entity_id, local_value, server_value, server_id, \
                                server_updated_at, conflict_type, strategy, explanation, status, \
                                detected_at, resolved_at";

/// libSQL storage for classified conflicts
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Store a conflict and return its id.
    ///
    /// A pending conflict of the same type for the same row is reused so
    /// repeated pulls do not pile up copies.
    pub async fn insert(&self, conflict: &ConflictRecord) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM sync_conflicts
                 WHERE kind = ? AND entity_id = ? AND conflict_type = ? AND status = 'pending'
                 LIMIT 1",
                [
                    conflict.kind.as_str(),
                    conflict.entity_id.as_str(),
                    conflict.conflict_type.as_str(),
                ],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            return Ok(row.get(0)?);
        }
        drop(rows);

        let local_value = serde_json::to_string(&conflict.local_value)?;
        let server_value = conflict
            .server_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .execute(
                "INSERT INTO sync_conflicts (
                    kind, entity_id, local_value, server_value, server_id, server_updated_at,
                    conflict_type, strategy, explanation, status, detected_at, resolved_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conflict.kind.as_str(),
                    conflict.entity_id.as_str(),
                    local_value,
                    server_value,
                    conflict.server_id.clone(),
                    conflict.server_updated_at,
                    conflict.conflict_type.as_str(),
                    conflict.strategy.as_str(),
                    conflict.explanation.as_str(),
                    conflict.status.as_str(),
                    conflict.detected_at,
                    conflict.resolved_at
                ],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<ConflictRecord>> {
        let conflicts = self
            .query_conflicts(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                [id],
            )
            .await?;
        Ok(conflicts.into_iter().next())
    }

    /// Pending conflicts, oldest first
    pub async fn list_pending(&self) -> Result<Vec<ConflictRecord>> {
        self.query_conflicts(
            &format!(
                "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                 WHERE status = 'pending' ORDER BY detected_at ASC, id ASC"
            ),
            (),
        )
        .await
    }

    /// Operator feed: pending conflicts that are never auto-applied
    pub async fn list_pending_manual(&self) -> Result<Vec<ConflictRecord>> {
        self.query_conflicts(
            &format!(
                "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                 WHERE status = 'pending' AND strategy = ?
                 ORDER BY detected_at ASC, id ASC"
            ),
            [ResolutionStrategy::Manual.as_str()],
        )
        .await
    }

    /// Most recent conflicts regardless of status
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        self.query_conflicts(
            &format!(
                "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                 ORDER BY detected_at DESC, id DESC LIMIT ?"
            ),
            [limit as i64],
        )
        .await
    }

    pub async fn count_pending_manual(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_conflicts WHERE status = 'pending' AND strategy = ?",
                [ResolutionStrategy::Manual.as_str()],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Close a conflict with the strategy that was actually applied
    pub async fn mark_resolved(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
        now: i64,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET status = ?, strategy = ?, resolved_at = ? WHERE id = ?",
                params![
                    ConflictStatus::Resolved.as_str(),
                    strategy.as_str(),
                    now,
                    id
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn query_conflicts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ConflictRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }
}

fn parse_conflict(row: &Row) -> Result<ConflictRecord> {
    let kind: String = row.get(1)?;
    let local_value: String = row.get(3)?;
    let server_value: Option<String> = row.get(4)?;
    let conflict_type: String = row.get(7)?;
    let strategy: String = row.get(8)?;
    let status: String = row.get(10)?;

    Ok(ConflictRecord {
        id: row.get(0)?,
        kind: kind.parse()?,
        entity_id: row.get(2)?,
        local_value: serde_json::from_str(&local_value)?,
        server_value: server_value
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        server_id: row.get(5)?,
        server_updated_at: row.get(6)?,
        conflict_type: conflict_type.parse()?,
        strategy: strategy.parse()?,
        explanation: row.get(9)?,
        status: status.parse()?,
        detected_at: row.get(11)?,
        resolved_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictType, ResourceKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn conflict(entity: &str, strategy: ResolutionStrategy) -> ConflictRecord {
        ConflictRecord {
            id: 0,
            kind: ResourceKind::LeaveRequest,
            entity_id: entity.to_string(),
            local_value: json!({ "status": "pending" }),
            server_value: Some(json!({ "status": "approved" })),
            server_id: Some("srv-1".to_string()),
            server_updated_at: Some(500),
            conflict_type: ConflictType::Approval,
            strategy,
            explanation: "approved on the server".to_string(),
            status: ConflictStatus::Pending,
            detected_at: 1_000,
            resolved_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        let original = conflict("lr-1", ResolutionStrategy::ServerWins);
        let id = repo.insert(&original).await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();

        assert_eq!(stored, ConflictRecord { id, ..original });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_reuses_pending_duplicate() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        let first = repo
            .insert(&conflict("lr-1", ResolutionStrategy::ServerWins))
            .await
            .unwrap();
        let second = repo
            .insert(&conflict("lr-1", ResolutionStrategy::ServerWins))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_manual_feed_and_resolution() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        repo.insert(&conflict("lr-1", ResolutionStrategy::ServerWins))
            .await
            .unwrap();
        let manual = repo
            .insert(&conflict("lr-2", ResolutionStrategy::Manual))
            .await
            .unwrap();

        let feed = repo.list_pending_manual().await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].entity_id, "lr-2");
        assert_eq!(repo.count_pending_manual().await.unwrap(), 1);

        assert!(repo
            .mark_resolved(manual, ResolutionStrategy::ClientWins, 2_000)
            .await
            .unwrap());
        let resolved = repo.get(manual).await.unwrap().unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.strategy, ResolutionStrategy::ClientWins);
        assert_eq!(resolved.resolved_at, Some(2_000));
        assert!(repo.list_pending_manual().await.unwrap().is_empty());
        assert_eq!(repo.list_recent(10).await.unwrap().len(), 2);
    }
}
