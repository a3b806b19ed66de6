//! Response cache repository

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::CacheEntry;

/// libSQL storage for cached GET bodies
pub struct LibSqlCacheRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCacheRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, method, path, body, timestamp, expires_at
                 FROM cache_entries WHERE key = ?",
                [key],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let body: String = row.get(3)?;
        Ok(Some(CacheEntry {
            key: row.get(0)?,
            method: row.get(1)?,
            path: row.get(2)?,
            body: serde_json::from_str(&body)?,
            timestamp: row.get(4)?,
            expires_at: row.get(5)?,
        }))
    }

    /// Insert or replace an entry in one statement
    pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let body = serde_json::to_string(&entry.body)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO cache_entries (key, method, path, body, timestamp, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    entry.key.as_str(),
                    entry.method.as_str(),
                    entry.path.as_str(),
                    body,
                    entry.timestamp,
                    entry.expires_at
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM cache_entries WHERE key = ?", [key])
            .await?;
        Ok(removed > 0)
    }

    /// Delete entries for `path` and everything beneath it
    pub async fn delete_path_prefix(&self, path: &str) -> Result<u64> {
        let nested = format!("{}/%", path.trim_end_matches('/'));
        Ok(self
            .conn
            .execute(
                "DELETE FROM cache_entries WHERE path = ? OR path LIKE ?",
                [path, nested.as_str()],
            )
            .await?)
    }

    pub async fn clear(&self) -> Result<u64> {
        Ok(self.conn.execute("DELETE FROM cache_entries", ()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn entry(path: &str, timestamp: i64) -> CacheEntry {
        CacheEntry {
            key: format!("GET {path}"),
            method: "GET".to_string(),
            path: path.to_string(),
            body: json!({ "path": path }),
            timestamp,
            expires_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_replaces_existing_key() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlCacheRepository::new(db.connection());

        repo.put(&entry("/api/leaves", 1)).await.unwrap();
        repo.put(&entry("/api/leaves", 2)).await.unwrap();

        let stored = repo.get("GET /api/leaves").await.unwrap().unwrap();
        assert_eq!(stored.timestamp, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_path_prefix_spares_siblings() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlCacheRepository::new(db.connection());

        repo.put(&entry("/api/leaves", 1)).await.unwrap();
        repo.put(&entry("/api/leaves/7", 1)).await.unwrap();
        repo.put(&entry("/api/leaves-archive", 1)).await.unwrap();
        repo.put(&entry("/api/balances", 1)).await.unwrap();

        assert_eq!(repo.delete_path_prefix("/api/leaves").await.unwrap(), 2);
        assert!(repo.get("GET /api/leaves-archive").await.unwrap().is_some());
        assert!(repo.get("GET /api/balances").await.unwrap().is_some());

        assert_eq!(repo.clear().await.unwrap(), 2);
    }
}
