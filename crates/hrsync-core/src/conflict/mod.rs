//! Conflict classification and resolution.
//!
//! The server is authoritative: approval decisions, duplicate submissions and
//! drift on server-owned data all resolve in its favour. Only conflicts the
//! server reports on push without enough context to classify are left for an
//! operator.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::{
    ConflictRecord, ConflictStatus, ConflictType, HttpMethod, MirrorRecord, NewQueueEntry,
    ResolutionStrategy, ServerRecord, SyncStatus,
};
use crate::services::DatabaseService;

/// Keys ignored when comparing local and server field values
const BOOKKEEPING_KEYS: [&str; 5] = ["id", "updated_at", "updatedAt", "created_at", "createdAt"];

/// What applying a conflict did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Server value written over the local row
    ServerApplied,
    /// Local duplicate deleted in favour of the server copy
    DuplicateDiscarded,
    /// Local value kept and queued for push
    ClientRequeued,
    /// Left for an operator; the row stays in `conflict`
    Deferred,
}

/// Classifies divergences and applies resolution strategies
#[derive(Clone)]
pub struct ConflictResolver {
    db: DatabaseService,
}

impl ConflictResolver {
    pub const fn new(db: DatabaseService) -> Self {
        Self { db }
    }

    /// Compare local mirror rows with server records.
    ///
    /// Yields at most one conflict per local row. Tombstones are ignored; pull
    /// applies them directly.
    pub fn classify(
        local: &[MirrorRecord],
        server: &[ServerRecord],
        now: i64,
    ) -> Vec<ConflictRecord> {
        let live_server = server
            .iter()
            .filter(|record| !record.deleted)
            .collect::<Vec<_>>();
        let mut conflicts = Vec::new();

        for row in local {
            let matched = live_server.iter().find(|record| {
                record.kind == row.kind
                    && (row.server_id.as_deref() == Some(record.id.as_str()) || row.id == record.id)
            });

            let conflict = match matched {
                Some(record) => approval_conflict(row, record, now)
                    .or_else(|| drift_conflict(row, record, now)),
                None => duplicate_conflict(row, local, &live_server, now),
            };
            conflicts.extend(conflict);
        }

        conflicts
    }

    /// Apply a conflict's strategy and close it unless it is manual.
    pub async fn resolve_conflict(&self, conflict: &ConflictRecord) -> Result<ResolutionOutcome> {
        let outcome = match conflict.strategy {
            ResolutionStrategy::ServerWins => self.apply_server_wins(conflict).await?,
            ResolutionStrategy::ClientWins => self.apply_client_wins(conflict).await?,
            ResolutionStrategy::Manual => {
                self.db
                    .set_mirror_status(conflict.kind, &conflict.entity_id, SyncStatus::Conflict)
                    .await?;
                return Ok(ResolutionOutcome::Deferred);
            }
        };

        if conflict.id > 0 {
            self.db
                .mark_conflict_resolved(conflict.id, conflict.strategy)
                .await?;
        }
        tracing::info!(
            "Resolved {} conflict on {} {} with {}",
            conflict.conflict_type,
            conflict.kind,
            conflict.entity_id,
            conflict.strategy
        );
        Ok(outcome)
    }

    /// Apply every pending conflict whose strategy is not manual.
    pub async fn auto_resolve_conflicts(&self) -> Result<usize> {
        let mut resolved = 0;
        for conflict in self.db.pending_conflicts().await? {
            if conflict.strategy == ResolutionStrategy::Manual {
                continue;
            }
            self.resolve_conflict(&conflict).await?;
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Conflicts awaiting an operator decision.
    pub async fn pending_manual_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.db.pending_manual_conflicts().await
    }

    /// Operator decision on a stored conflict.
    pub async fn resolve_with(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionOutcome> {
        if strategy == ResolutionStrategy::Manual {
            return Err(Error::InvalidInput(
                "choose server_wins or client_wins to resolve a conflict".to_string(),
            ));
        }
        let conflict = self
            .db
            .get_conflict(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(Error::InvalidOperation(format!(
                "conflict {id} is already resolved"
            )));
        }
        if strategy == ResolutionStrategy::ClientWins && conflict.kind.is_server_authoritative() {
            return Err(Error::InvalidOperation(format!(
                "{} records are owned by the server; conflict {id} can only take the server value",
                conflict.kind
            )));
        }

        self.resolve_conflict(&ConflictRecord {
            strategy,
            ..conflict
        })
        .await
    }

    async fn apply_server_wins(&self, conflict: &ConflictRecord) -> Result<ResolutionOutcome> {
        self.drop_queued_writes(conflict).await?;

        if conflict.conflict_type == ConflictType::DuplicateSubmission {
            self.db
                .delete_mirror(conflict.kind, &conflict.entity_id)
                .await?;
            return Ok(ResolutionOutcome::DuplicateDiscarded);
        }

        match &conflict.server_value {
            Some(server_value) => {
                self.db
                    .apply_server_value(
                        conflict.kind,
                        &conflict.entity_id,
                        conflict.server_id.as_deref(),
                        server_value,
                        conflict.server_updated_at,
                    )
                    .await?;
            }
            None => {
                self.db
                    .set_mirror_status(conflict.kind, &conflict.entity_id, SyncStatus::Synced)
                    .await?;
            }
        }
        Ok(ResolutionOutcome::ServerApplied)
    }

    /// Re-queue the local value. A record the server never confirmed is
    /// created again rather than updated.
    async fn apply_client_wins(&self, conflict: &ConflictRecord) -> Result<ResolutionOutcome> {
        let (method, target) = match &conflict.server_id {
            Some(server_id) => (HttpMethod::Put, server_id.clone()),
            None => (HttpMethod::Post, conflict.entity_id.clone()),
        };

        self.db
            .upsert_local(conflict.kind, &conflict.entity_id, &conflict.local_value)
            .await?;
        self.db
            .enqueue(NewQueueEntry::new(
                method,
                conflict.kind,
                target,
                conflict.local_value.clone(),
            ))
            .await?;
        Ok(ResolutionOutcome::ClientRequeued)
    }

    async fn drop_queued_writes(&self, conflict: &ConflictRecord) -> Result<()> {
        let mut dropped = self
            .db
            .remove_queued_for_record(conflict.kind, &conflict.entity_id)
            .await?;
        // A duplicate's server id belongs to the surviving record
        let shared_server_id = conflict
            .server_id
            .as_deref()
            .filter(|_| conflict.conflict_type != ConflictType::DuplicateSubmission)
            .filter(|server_id| *server_id != conflict.entity_id);
        if let Some(server_id) = shared_server_id {
            dropped += self
                .db
                .remove_queued_for_record(conflict.kind, server_id)
                .await?;
        }
        if dropped > 0 {
            tracing::warn!(
                "Dropped {dropped} queued writes for {} {} superseded by the server",
                conflict.kind,
                conflict.entity_id
            );
        }
        Ok(())
    }
}

fn new_conflict(
    row: &MirrorRecord,
    server_id: &str,
    server_value: &serde_json::Value,
    server_updated_at: Option<i64>,
    conflict_type: ConflictType,
    explanation: String,
    now: i64,
) -> ConflictRecord {
    ConflictRecord {
        id: 0,
        kind: row.kind,
        entity_id: row.id.clone(),
        local_value: row.data.clone(),
        server_value: Some(server_value.clone()),
        server_id: Some(server_id.to_string()),
        server_updated_at,
        conflict_type,
        strategy: ResolutionStrategy::ServerWins,
        explanation,
        status: ConflictStatus::Pending,
        detected_at: now,
        resolved_at: None,
    }
}

/// Server holds a final decision the local row does not reflect.
fn approval_conflict(
    row: &MirrorRecord,
    record: &ServerRecord,
    now: i64,
) -> Option<ConflictRecord> {
    let server_fields = record.leave_fields()?;
    if !server_fields.is_terminal() {
        return None;
    }
    let local_status = row.leave_fields().and_then(|fields| fields.status);
    if local_status == server_fields.status {
        return None;
    }

    let server_status = server_fields.status.unwrap_or_default();
    Some(new_conflict(
        row,
        &record.id,
        &record.data,
        record.updated_at,
        ConflictType::Approval,
        format!(
            "Leave request {} was {server_status} on the server while the device shows {}; approval decisions are final",
            record.id,
            local_status.as_deref().unwrap_or("no status")
        ),
        now,
    ))
}

/// Server-owned data changed under unsynced local edits.
fn drift_conflict(row: &MirrorRecord, record: &ServerRecord, now: i64) -> Option<ConflictRecord> {
    if !row.kind.is_server_authoritative() || !row.has_local_edits() {
        return None;
    }
    let server_updated_at = record.updated_at?;
    let bookmark = row.local_updated_at.or(row.server_updated_at);
    if bookmark.is_some_and(|bookmark| server_updated_at <= bookmark) {
        return None;
    }
    if !fields_differ(&row.data, &record.data) {
        return None;
    }

    Some(new_conflict(
        row,
        &record.id,
        &record.data,
        record.updated_at,
        ConflictType::ServerDrift,
        format!(
            "{} {} changed on the server after the local edit; server data is authoritative",
            row.kind, row.id
        ),
        now,
    ))
}

/// A local-only leave request matches a server-confirmed one.
fn duplicate_conflict(
    row: &MirrorRecord,
    local: &[MirrorRecord],
    server: &[&ServerRecord],
    now: i64,
) -> Option<ConflictRecord> {
    if row.server_id.is_some() {
        return None;
    }
    let fields = row.leave_fields()?;

    if let Some(record) = server.iter().find(|record| {
        record.id != row.id
            && record
                .leave_fields()
                .is_some_and(|other| other.same_submission(&fields))
    }) {
        return Some(duplicate_of(row, &record.id, &record.data, record.updated_at, now));
    }

    local
        .iter()
        .filter(|other| other.kind == row.kind && other.id != row.id)
        .find_map(|other| {
            let server_id = other.server_id.as_deref()?;
            other
                .leave_fields()
                .filter(|other_fields| other_fields.same_submission(&fields))
                .map(|_| duplicate_of(row, server_id, &other.data, other.server_updated_at, now))
        })
}

fn duplicate_of(
    row: &MirrorRecord,
    server_id: &str,
    server_value: &serde_json::Value,
    server_updated_at: Option<i64>,
    now: i64,
) -> ConflictRecord {
    new_conflict(
        row,
        server_id,
        server_value,
        server_updated_at,
        ConflictType::DuplicateSubmission,
        format!(
            "Local leave request {} duplicates server request {server_id}; the local copy is discarded",
            row.id
        ),
        now,
    )
}

/// Field-level comparison ignoring timestamps.
fn fields_differ(local: &serde_json::Value, server: &serde_json::Value) -> bool {
    match (local, server) {
        (serde_json::Value::Object(local), serde_json::Value::Object(server)) => {
            let significant = |(key, _): &(&String, &serde_json::Value)| {
                !BOOKKEEPING_KEYS.contains(&key.as_str())
            };
            let local = local.iter().filter(significant).collect::<BTreeMap<_, _>>();
            let server = server.iter().filter(significant).collect::<BTreeMap<_, _>>();
            local != server
        }
        _ => local != server,
    }
}
