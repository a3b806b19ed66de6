//! Sync metadata key/value repository

use libsql::{params, Connection};

use crate::error::Result;

/// Checkpoint of the last fully successful pull (Unix ms)
pub const LAST_SYNC_AT: &str = "last_sync_at";
/// Time of the last push pass that drained at least one entry (Unix ms)
pub const LAST_PUSH_AT: &str = "last_push_at";

/// libSQL storage for sync bookkeeping values
pub struct LibSqlMetadataRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMetadataRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_metadata WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at) VALUES (?, ?, ?)",
                params![key, value, now],
            )
            .await?;
        Ok(())
    }

    /// Read a millisecond timestamp; unparsable values read as unset
    pub async fn get_millis(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .get(key)
            .await?
            .and_then(|value| value.trim().parse().ok()))
    }

    pub async fn set_millis(&self, key: &str, millis: i64, now: i64) -> Result<()> {
        self.set(key, &millis.to_string(), now).await
    }
}
