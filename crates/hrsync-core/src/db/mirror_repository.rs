//! Mirror record repository implementation

use libsql::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::{MirrorRecord, ResourceKind, ServerRecord, SyncStatus};

const MIRROR_COLUMNS: &str = "kind, id, server_id, data, sync_status, server_updated_at, \
                              local_updated_at, created_at, updated_at";

/// What a pulled record did to the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same fields and timestamp; only `sync_status` was re-set
    Unchanged,
}

/// Trait for mirror storage operations (async)
#[allow(async_fn_in_trait)]
pub trait MirrorRepository {
    async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<MirrorRecord>>;

    /// Find the row a server id refers to, by local id or confirmed server id
    async fn find_for_server_id(
        &self,
        kind: ResourceKind,
        server_id: &str,
    ) -> Result<Option<MirrorRecord>>;

    async fn list(&self, kind: ResourceKind) -> Result<Vec<MirrorRecord>>;

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<MirrorRecord>>;

    /// Overwrite local fields with server truth (last-pull-wins)
    async fn upsert_from_server(&self, record: &ServerRecord, now: i64) -> Result<UpsertOutcome>;

    /// Record a local mutation; the row becomes `pending`
    async fn upsert_local(
        &self,
        kind: ResourceKind,
        id: &str,
        data: &serde_json::Value,
        now: i64,
    ) -> Result<MirrorRecord>;

    /// Push succeeded: remember the server identity and set `status`
    /// (`pending` while later writes of the row are still queued)
    async fn mark_pushed(
        &self,
        kind: ResourceKind,
        id: &str,
        server_id: Option<&str>,
        server_updated_at: Option<i64>,
        status: SyncStatus,
        now: i64,
    ) -> Result<()>;

    /// Replace local fields with a server value during conflict resolution
    async fn apply_server_value(
        &self,
        kind: ResourceKind,
        id: &str,
        server_id: Option<&str>,
        data: &serde_json::Value,
        server_updated_at: Option<i64>,
        now: i64,
    ) -> Result<()>;

    async fn set_status(
        &self,
        kind: ResourceKind,
        id: &str,
        status: SyncStatus,
        now: i64,
    ) -> Result<bool>;

    /// Hard delete; only tombstones and duplicate resolution call this
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<bool>;
}

/// libSQL implementation of `MirrorRepository`
pub struct LibSqlMirrorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMirrorRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<MirrorRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    /// Count rows per sync status
    pub async fn count_by_status(&self, status: SyncStatus) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM mirror_records WHERE sync_status = ?",
                [status.as_str()],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

impl MirrorRepository for LibSqlMirrorRepository<'_> {
    async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<MirrorRecord>> {
        let records = self
            .query_records(
                &format!("SELECT {MIRROR_COLUMNS} FROM mirror_records WHERE kind = ? AND id = ?"),
                [kind.as_str(), id],
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn find_for_server_id(
        &self,
        kind: ResourceKind,
        server_id: &str,
    ) -> Result<Option<MirrorRecord>> {
        // Prefer the row already confirmed under this server id
        let records = self
            .query_records(
                &format!(
                    "SELECT {MIRROR_COLUMNS} FROM mirror_records
                     WHERE kind = ? AND (server_id = ? OR id = ?)
                     ORDER BY CASE WHEN server_id = ? THEN 0 ELSE 1 END
                     LIMIT 1"
                ),
                [kind.as_str(), server_id, server_id, server_id],
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<MirrorRecord>> {
        self.query_records(
            &format!(
                "SELECT {MIRROR_COLUMNS} FROM mirror_records WHERE kind = ? ORDER BY created_at, id"
            ),
            [kind.as_str()],
        )
        .await
    }

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<MirrorRecord>> {
        self.query_records(
            &format!(
                "SELECT {MIRROR_COLUMNS} FROM mirror_records
                 WHERE sync_status = ? ORDER BY updated_at DESC, id"
            ),
            [status.as_str()],
        )
        .await
    }

    async fn upsert_from_server(&self, record: &ServerRecord, now: i64) -> Result<UpsertOutcome> {
        let existing = self.find_for_server_id(record.kind, &record.id).await?;
        let data = serde_json::to_string(&record.data)?;

        let Some(existing) = existing else {
            self.conn
                .execute(
                    &format!(
                        "INSERT INTO mirror_records ({MIRROR_COLUMNS})
                         VALUES (?, ?, ?, ?, 'synced', ?, NULL, ?, ?)"
                    ),
                    params![
                        record.kind.as_str(),
                        record.id.as_str(),
                        record.id.as_str(),
                        data,
                        record.updated_at,
                        now,
                        now
                    ],
                )
                .await?;
            return Ok(UpsertOutcome::Inserted);
        };

        let unchanged = existing.data == record.data
            && existing.server_updated_at == record.updated_at
            && existing.server_id.as_deref() == Some(record.id.as_str());

        if unchanged {
            self.conn
                .execute(
                    "UPDATE mirror_records SET sync_status = 'synced' WHERE kind = ? AND id = ?",
                    [record.kind.as_str(), existing.id.as_str()],
                )
                .await?;
            return Ok(UpsertOutcome::Unchanged);
        }

        self.conn
            .execute(
                "UPDATE mirror_records
                 SET server_id = ?, data = ?, sync_status = 'synced',
                     server_updated_at = ?, updated_at = ?
                 WHERE kind = ? AND id = ?",
                params![
                    record.id.as_str(),
                    data,
                    record.updated_at,
                    now,
                    record.kind.as_str(),
                    existing.id.as_str()
                ],
            )
            .await?;
        Ok(UpsertOutcome::Updated)
    }

    async fn upsert_local(
        &self,
        kind: ResourceKind,
        id: &str,
        data: &serde_json::Value,
        now: i64,
    ) -> Result<MirrorRecord> {
        let encoded = serde_json::to_string(data)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO mirror_records ({MIRROR_COLUMNS})
                     VALUES (?, ?, NULL, ?, 'pending', NULL, ?, ?, ?)
                     ON CONFLICT(kind, id) DO UPDATE SET
                         data = excluded.data,
                         sync_status = 'pending',
                         local_updated_at = excluded.local_updated_at,
                         updated_at = excluded.updated_at"
                ),
                params![kind.as_str(), id, encoded, now, now, now],
            )
            .await?;

        self.get(kind, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
    }

    async fn mark_pushed(
        &self,
        kind: ResourceKind,
        id: &str,
        server_id: Option<&str>,
        server_updated_at: Option<i64>,
        status: SyncStatus,
        now: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE mirror_records
                 SET sync_status = ?,
                     server_id = COALESCE(?, server_id),
                     server_updated_at = COALESCE(?, server_updated_at),
                     updated_at = ?
                 WHERE kind = ? AND id = ?",
                params![status.as_str(), server_id, server_updated_at, now, kind.as_str(), id],
            )
            .await?;
        Ok(())
    }

    async fn apply_server_value(
        &self,
        kind: ResourceKind,
        id: &str,
        server_id: Option<&str>,
        data: &serde_json::Value,
        server_updated_at: Option<i64>,
        now: i64,
    ) -> Result<()> {
        let encoded = serde_json::to_string(data)?;
        // The local bookmark catches up with the server value it now holds
        let updated = self
            .conn
            .execute(
                "UPDATE mirror_records
                 SET data = ?, sync_status = 'synced',
                     server_id = COALESCE(?, server_id),
                     server_updated_at = COALESCE(?, server_updated_at),
                     local_updated_at = COALESCE(?, server_updated_at, local_updated_at),
                     updated_at = ?
                 WHERE kind = ? AND id = ?",
                params![
                    encoded,
                    server_id,
                    server_updated_at,
                    server_updated_at,
                    now,
                    kind.as_str(),
                    id
                ],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        kind: ResourceKind,
        id: &str,
        status: SyncStatus,
        now: i64,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE mirror_records SET sync_status = ?, updated_at = ? WHERE kind = ? AND id = ?",
                params![status.as_str(), now, kind.as_str(), id],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM mirror_records WHERE kind = ? AND id = ?",
                [kind.as_str(), id],
            )
            .await?;
        Ok(removed > 0)
    }
}

fn parse_record(row: &Row) -> Result<MirrorRecord> {
    let kind: String = row.get(0)?;
    let data: String = row.get(3)?;
    let status: String = row.get(4)?;

    Ok(MirrorRecord {
        kind: kind.parse()?,
        id: row.get(1)?,
        server_id: row.get(2)?,
        data: serde_json::from_str(&data)?,
        sync_status: status.parse()?,
        server_updated_at: row.get(5)?,
        local_updated_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
