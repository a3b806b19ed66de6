//! Write queue entry model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{HttpMethod, ResourceKind};
use crate::error::{Error, Result};

/// Retry budget applied when the caller does not pick one.
pub const DEFAULT_MAX_RETRIES: i64 = 5;

/// A unique identifier for a queued write, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueEntryId(Uuid);

impl QueueEntryId {
    /// Create a new unique queue entry ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for QueueEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueEntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Extra request headers replayed with a queued write
pub type QueueHeaders = BTreeMap<String, String>;

/// Parameters for appending a write to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueEntry {
    pub method: HttpMethod,
    pub kind: ResourceKind,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub headers: Option<QueueHeaders>,
    pub priority: i64,
    pub max_retries: i64,
}

impl NewQueueEntry {
    /// Describe a write with default priority and retry budget.
    pub fn new(
        method: HttpMethod,
        kind: ResourceKind,
        record_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            method,
            kind,
            record_id: record_id.into(),
            payload,
            headers: None,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: QueueHeaders) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Build a queue entry from a raw `method path payload` request.
    ///
    /// The path must address a registered resource. The record id is taken
    /// from the path, then from `payload.id`, and is otherwise minted as a
    /// client-side id.
    pub fn from_request(
        method: HttpMethod,
        path: &str,
        payload: serde_json::Value,
        headers: Option<QueueHeaders>,
    ) -> Result<Self> {
        if !method.is_mutating() {
            return Err(Error::InvalidOperation(format!(
                "{method} requests cannot be queued"
            )));
        }

        let (kind, path_record) = ResourceKind::from_path(path).ok_or_else(|| {
            Error::InvalidOperation(format!("no registered resource for path {path}"))
        })?;

        let record_id = match (path_record, payload_record_id(&payload)) {
            (Some(id), _) | (None, Some(id)) => id,
            (None, None) if method == HttpMethod::Post => local_record_id(),
            (None, None) => {
                return Err(Error::InvalidOperation(format!(
                    "{method} {path} does not identify a record"
                )))
            }
        };

        let mut entry = Self::new(method, kind, record_id, payload);
        entry.headers = headers;
        Ok(entry)
    }

    /// Materialize the entry with a fresh id and the current time.
    pub fn into_entry(self, created_at: i64) -> QueueEntry {
        QueueEntry {
            id: QueueEntryId::new(),
            method: self.method,
            kind: self.kind,
            record_id: self.record_id,
            payload: self.payload,
            headers: self.headers,
            priority: self.priority,
            retries: 0,
            max_retries: self.max_retries.max(1),
            last_error: None,
            created_at,
            last_attempt_at: None,
        }
    }
}

/// Prefix of record ids minted on the device before the server assigns one
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Mint a client-side record id.
pub fn local_record_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7())
}

fn payload_record_id(payload: &serde_json::Value) -> Option<String> {
    match payload.get("id")? {
        serde_json::Value::String(value) if !value.trim().is_empty() => Some(value.clone()),
        serde_json::Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

/// A pending mutating request waiting to be replayed against the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub method: HttpMethod,
    pub kind: ResourceKind,
    /// Client- or server-assigned record identifier
    pub record_id: String,
    /// Opaque JSON body sent to the server
    pub payload: serde_json::Value,
    pub headers: Option<QueueHeaders>,
    /// Higher replays first
    pub priority: i64,
    pub retries: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    /// Last replay attempt (Unix ms)
    pub last_attempt_at: Option<i64>,
}

impl QueueEntry {
    /// Whether another failure should quarantine this entry.
    pub const fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Earliest time the entry may be attempted again given a backoff policy.
    pub fn next_attempt_at(&self, base_ms: i64, max_ms: i64) -> i64 {
        let Some(last_attempt) = self.last_attempt_at else {
            return self.created_at;
        };
        if self.retries <= 0 || base_ms <= 0 {
            return last_attempt;
        }
        let exponent = u32::try_from(self.retries - 1).unwrap_or(u32::MAX).min(20);
        let delay = base_ms.saturating_mul(1_i64 << exponent).min(max_ms.max(base_ms));
        last_attempt.saturating_add(delay)
    }
}
