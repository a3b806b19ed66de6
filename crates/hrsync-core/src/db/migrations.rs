//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run a migration's statements inside one transaction.
///
/// libsql doesn't have execute_batch, so each statement runs separately.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: write queue, dead letters, sync metadata
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                method TEXT NOT NULL CHECK(method IN ('POST', 'PUT', 'PATCH', 'DELETE')),
                kind TEXT NOT NULL,
                record_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                headers TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                retries INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                last_error TEXT,
                last_attempt_at INTEGER,
                created_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_order
                ON sync_queue(priority DESC, created_at ASC, id ASC)",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue(kind, record_id)",
            "CREATE TABLE IF NOT EXISTS dead_letter_queue (
                id TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                kind TEXT NOT NULL,
                record_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                headers TEXT,
                priority INTEGER NOT NULL,
                retries INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                last_error TEXT,
                last_attempt_at INTEGER,
                created_at INTEGER NOT NULL,
                error_message TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                failed_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_dead_letter_failed ON dead_letter_queue(failed_at DESC)",
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "INSERT OR IGNORE INTO sync_metadata (key, value, updated_at)
                VALUES ('sync_schema_version', '3', 0)",
        ],
    )
    .await
}

/// Migration to version 2: canonical mirror table for server entities
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        &[
            "CREATE TABLE IF NOT EXISTS mirror_records (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                server_id TEXT,
                data TEXT NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'synced'
                    CHECK(sync_status IN ('synced', 'pending', 'conflict', 'error')),
                server_updated_at INTEGER,
                local_updated_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (kind, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_mirror_server_id ON mirror_records(kind, server_id)",
            "CREATE INDEX IF NOT EXISTS idx_mirror_status ON mirror_records(sync_status)",
        ],
    )
    .await
}

/// Migration to version 3: response cache and conflict log
async fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        3,
        &[
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                expires_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_cache_path ON cache_entries(path)",
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_value TEXT NOT NULL,
                server_value TEXT,
                server_id TEXT,
                server_updated_at INTEGER,
                conflict_type TEXT NOT NULL,
                strategy TEXT NOT NULL,
                explanation TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                detected_at INTEGER NOT NULL,
                resolved_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_status ON sync_conflicts(status, detected_at)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(kind, entity_id)",
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_sync_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in [
            "sync_queue",
            "dead_letter_queue",
            "sync_metadata",
            "mirror_records",
            "cache_entries",
            "sync_conflicts",
        ] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queue_rejects_non_mutating_method() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let result = conn
            .execute(
                "INSERT INTO sync_queue (id, method, kind, record_id, payload, created_at)
                 VALUES ('x', 'GET', 'employee', 'e-1', '{}', 0)",
                (),
            )
            .await;
        assert!(result.is_err());
    }
}
