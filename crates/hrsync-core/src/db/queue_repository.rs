//! Write queue and dead-letter repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use libsql::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::{DeadLetterEntry, QueueEntry, QueueEntryId, QueueHeaders, ResourceKind};

const QUEUE_COLUMNS: &str = "id, method, kind, record_id, payload, headers, priority, retries, \
                             max_retries, last_error, last_attempt_at, created_at";

const ORDER_BY: &str = "ORDER BY priority DESC, created_at ASC, id ASC";

/// Result of charging a failed attempt to a queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Entry stays queued with the new retry count
    Retrying { retries: i64, max_retries: i64 },
    /// Budget exhausted; entry now lives in the dead-letter store
    DeadLettered { retries: i64 },
}

/// Trait for durable write queue operations (async)
#[allow(async_fn_in_trait)]
pub trait QueueRepository {
    /// Append an entry in a single atomic insert
    async fn insert(&self, entry: &QueueEntry) -> Result<()>;

    /// All entries in replay order (priority desc, created_at asc)
    async fn list(&self) -> Result<Vec<QueueEntry>>;

    /// First `limit` entries in replay order
    async fn list_batch(&self, limit: usize) -> Result<Vec<QueueEntry>>;

    async fn get(&self, id: &QueueEntryId) -> Result<Option<QueueEntry>>;

    /// Remove an entry; returns whether it existed
    async fn dequeue(&self, id: &QueueEntryId) -> Result<bool>;

    /// Remove every entry; returns the number removed
    async fn clear(&self) -> Result<u64>;

    async fn count(&self) -> Result<usize>;

    /// Drop queued writes targeting one record
    async fn remove_for_record(&self, kind: ResourceKind, record_id: &str) -> Result<u64>;

    /// Queued writes targeting one record
    async fn count_for_record(&self, kind: ResourceKind, record_id: &str) -> Result<usize>;

    /// Charge a failed attempt; quarantines the entry once retries reach
    /// `max_retries`.
    async fn record_failure(
        &self,
        id: &QueueEntryId,
        error: &str,
        now: i64,
    ) -> Result<FailureOutcome>;
}

/// libSQL implementation of `QueueRepository`
pub struct LibSqlQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_entries(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<QueueEntry>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(parse_entry(&row, 0)?);
        }
        Ok(entries)
    }

    async fn record_failure_in_tx(
        &self,
        id: &QueueEntryId,
        error: &str,
        now: i64,
    ) -> Result<FailureOutcome> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_queue
                 SET retries = retries + 1, last_error = ?, last_attempt_at = ?
                 WHERE id = ?",
                params![error, now, id.as_str()],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("queue entry {id}")));
        }

        let mut rows = self
            .conn
            .query(
                "SELECT retries, max_retries FROM sync_queue WHERE id = ?",
                [id.as_str()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Err(Error::NotFound(format!("queue entry {id}")));
        };
        let retries: i64 = row.get(0)?;
        let max_retries: i64 = row.get(1)?;
        drop(rows);

        if retries < max_retries {
            return Ok(FailureOutcome::Retrying {
                retries,
                max_retries,
            });
        }

        self.conn
            .execute(
                &format!(
                    "INSERT INTO dead_letter_queue ({QUEUE_COLUMNS}, error_message, retry_count, failed_at)
                     SELECT {QUEUE_COLUMNS}, ?, retries, ? FROM sync_queue WHERE id = ?"
                ),
                params![error, now, id.as_str()],
            )
            .await?;
        self.conn
            .execute("DELETE FROM sync_queue WHERE id = ?", [id.as_str()])
            .await?;

        Ok(FailureOutcome::DeadLettered { retries })
    }
}

impl QueueRepository for LibSqlQueueRepository<'_> {
    async fn insert(&self, entry: &QueueEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let headers = entry
            .headers
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO sync_queue ({QUEUE_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    entry.id.as_str(),
                    entry.method.as_str(),
                    entry.kind.as_str(),
                    entry.record_id.as_str(),
                    payload,
                    headers,
                    entry.priority,
                    entry.retries,
                    entry.max_retries,
                    entry.last_error.clone(),
                    entry.last_attempt_at,
                    entry.created_at
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        self.query_entries(&format!("SELECT {QUEUE_COLUMNS} FROM sync_queue {ORDER_BY}"), ())
            .await
    }

    async fn list_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        self.query_entries(
            &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue {ORDER_BY} LIMIT ?"),
            [limit as i64],
        )
        .await
    }

    async fn get(&self, id: &QueueEntryId) -> Result<Option<QueueEntry>> {
        let entries = self
            .query_entries(
                &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = ?"),
                [id.as_str()],
            )
            .await?;
        Ok(entries.into_iter().next())
    }

    async fn dequeue(&self, id: &QueueEntryId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM sync_queue WHERE id = ?", [id.as_str()])
            .await?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<u64> {
        Ok(self.conn.execute("DELETE FROM sync_queue", ()).await?)
    }

    async fn count(&self) -> Result<usize> {
        count_rows(self.conn, "SELECT COUNT(*) FROM sync_queue").await
    }

    async fn remove_for_record(&self, kind: ResourceKind, record_id: &str) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM sync_queue WHERE kind = ? AND record_id = ?",
                [kind.as_str(), record_id],
            )
            .await?)
    }

    async fn count_for_record(&self, kind: ResourceKind, record_id: &str) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_queue WHERE kind = ? AND record_id = ?",
                [kind.as_str(), record_id],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn record_failure(
        &self,
        id: &QueueEntryId,
        error: &str,
        now: i64,
    ) -> Result<FailureOutcome> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;
        match self.record_failure_in_tx(id, error, now).await {
            Ok(outcome) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(outcome)
            }
            Err(error) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(error)
            }
        }
    }
}

/// libSQL repository for quarantined writes
pub struct LibSqlDeadLetterRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlDeadLetterRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Most recently quarantined first
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS}, error_message, retry_count, failed_at
                     FROM dead_letter_queue
                     ORDER BY failed_at DESC, id ASC
                     LIMIT ?"
                ),
                [limit as i64],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(DeadLetterEntry {
                entry: parse_entry(&row, 0)?,
                error_message: row.get(12)?,
                retry_count: row.get(13)?,
                failed_at: row.get(14)?,
            });
        }
        Ok(entries)
    }

    pub async fn count(&self) -> Result<usize> {
        count_rows(self.conn, "SELECT COUNT(*) FROM dead_letter_queue").await
    }

    /// Move a dead letter back into the active queue with a fresh budget.
    pub async fn requeue(&self, id: &QueueEntryId) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;
        match self.requeue_in_tx(id).await {
            Ok(()) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(error) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(error)
            }
        }
    }

    async fn requeue_in_tx(&self, id: &QueueEntryId) -> Result<()> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO sync_queue (id, method, kind, record_id, payload, headers, priority,
                     retries, max_retries, last_error, last_attempt_at, created_at)
                 SELECT id, method, kind, record_id, payload, headers, priority,
                        0, max_retries, last_error, NULL, created_at
                 FROM dead_letter_queue WHERE id = ?",
                [id.as_str()],
            )
            .await?;
        if inserted == 0 {
            return Err(Error::NotFound(format!("dead letter {id}")));
        }
        self.conn
            .execute("DELETE FROM dead_letter_queue WHERE id = ?", [id.as_str()])
            .await?;
        Ok(())
    }

    /// Permanently discard one dead letter
    pub async fn purge(&self, id: &QueueEntryId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM dead_letter_queue WHERE id = ?", [id.as_str()])
            .await?;
        Ok(removed > 0)
    }

    pub async fn clear(&self) -> Result<u64> {
        Ok(self.conn.execute("DELETE FROM dead_letter_queue", ()).await?)
    }
}

async fn count_rows(conn: &Connection, sql: &str) -> Result<usize> {
    let mut rows = conn.query(sql, ()).await?;
    let count: i64 = match rows.next().await? {
        Some(row) => row.get(0)?,
        None => 0,
    };
    Ok(usize::try_from(count).unwrap_or_default())
}

/// Parse queue columns starting at `offset`
fn parse_entry(row: &Row, offset: i32) -> Result<QueueEntry> {
    let id: String = row.get(offset)?;
    let method: String = row.get(offset + 1)?;
    let kind: String = row.get(offset + 2)?;
    let payload: String = row.get(offset + 4)?;
    let headers: Option<String> = row.get(offset + 5)?;

    Ok(QueueEntry {
        id: id
            .parse()
            .map_err(|_| Error::Database(format!("invalid queue entry id: {id}")))?,
        method: method.parse()?,
        kind: kind.parse()?,
        record_id: row.get(offset + 3)?,
        payload: serde_json::from_str(&payload)?,
        headers: headers
            .map(|raw| serde_json::from_str::<QueueHeaders>(&raw))
            .transpose()?,
        priority: row.get(offset + 6)?,
        retries: row.get(offset + 7)?,
        max_retries: row.get(offset + 8)?,
        last_error: row.get(offset + 9)?,
        last_attempt_at: row.get(offset + 10)?,
        created_at: row.get(offset + 11)?,
    })
}
