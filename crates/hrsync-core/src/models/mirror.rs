//! Mirror record model: local replicas of server-owned entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ResourceKind;
use crate::error::{Error, Result};
use crate::util::parse_rfc3339_millis;

/// Sync bookkeeping state of a mirror row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// Local replica of a server entity plus sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub kind: ResourceKind,
    /// Local identifier (client-minted or equal to the server id)
    pub id: String,
    /// Server-assigned identifier once confirmed
    pub server_id: Option<String>,
    /// Entity fields as JSON
    pub data: serde_json::Value,
    pub sync_status: SyncStatus,
    /// Set only by pull (Unix ms)
    pub server_updated_at: Option<i64>,
    /// Set only by local mutation or conflict resolution (Unix ms)
    pub local_updated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MirrorRecord {
    /// Whether the row carries local edits not yet confirmed by the server.
    pub fn has_local_edits(&self) -> bool {
        if matches!(self.sync_status, SyncStatus::Pending | SyncStatus::Conflict) {
            return true;
        }
        match (self.local_updated_at, self.server_updated_at) {
            (Some(local), Some(server)) => local > server,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Leave-request identity fields, when this row is a leave request.
    pub fn leave_fields(&self) -> Option<LeaveRequestFields> {
        (self.kind == ResourceKind::LeaveRequest)
            .then(|| LeaveRequestFields::from_value(&self.data))
            .flatten()
    }
}

/// A record as delivered by the server during pull or push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub kind: ResourceKind,
    pub id: String,
    /// Server modification time (Unix ms)
    pub updated_at: Option<i64>,
    /// Tombstone marker: the server deleted this record
    pub deleted: bool,
    pub data: serde_json::Value,
}

impl ServerRecord {
    /// Parse a server JSON object. Requires an `id`; understands
    /// `updated_at`/`updatedAt` and `deleted`/`deleted_at` markers.
    pub fn from_json(kind: ResourceKind, data: serde_json::Value) -> Result<Self> {
        let id = json_text(&data, &["id", "server_id"]).ok_or_else(|| {
            Error::InvalidInput(format!("{kind} record from server has no id"))
        })?;

        let updated_at = json_text(&data, &["updated_at", "updatedAt"])
            .and_then(|value| parse_rfc3339_millis(&value))
            .or_else(|| {
                ["updated_at", "updatedAt"]
                    .iter()
                    .find_map(|key| data.get(*key).and_then(serde_json::Value::as_i64))
            });

        let deleted = data
            .get("deleted")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
            || ["deleted_at", "deletedAt"]
                .iter()
                .any(|key| data.get(*key).is_some_and(|value| !value.is_null()));

        Ok(Self {
            kind,
            id,
            updated_at,
            deleted,
            data,
        })
    }

    pub fn leave_fields(&self) -> Option<LeaveRequestFields> {
        (self.kind == ResourceKind::LeaveRequest)
            .then(|| LeaveRequestFields::from_value(&self.data))
            .flatten()
    }
}

/// Fields that identify a logical leave request and its approval state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveRequestFields {
    pub staff_id: String,
    pub start_date: String,
    pub end_date: String,
    pub status: Option<String>,
}

impl LeaveRequestFields {
    pub fn from_value(data: &serde_json::Value) -> Option<Self> {
        Some(Self {
            staff_id: json_text(data, &["staff_id", "staffId"])?,
            start_date: json_text(data, &["start_date", "startDate"])?,
            end_date: json_text(data, &["end_date", "endDate"])?,
            status: json_text(data, &["status"]).map(|status| status.to_ascii_lowercase()),
        })
    }

    /// Same owner and same date range.
    pub fn same_submission(&self, other: &Self) -> bool {
        self.staff_id == other.staff_id
            && self.start_date == other.start_date
            && self.end_date == other.end_date
    }

    /// Approval decisions that can never be overridden locally.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_deref(), Some("approved" | "rejected"))
    }
}

fn json_text(data: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match data.get(*key)? {
        serde_json::Value::String(value) if !value.trim().is_empty() => {
            Some(value.trim().to_string())
        }
        serde_json::Value::Number(value) => Some(value.to_string()),
        _ => None,
    })
}
