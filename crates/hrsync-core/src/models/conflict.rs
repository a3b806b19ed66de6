//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ResourceKind;
use crate::error::{Error, Result};

/// How a local record diverged from server truth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Server holds a final approval decision that differs from the local view
    Approval,
    /// A local-only record duplicates a server-confirmed one
    DuplicateSubmission,
    /// Server-owned data changed while the device held local edits
    ServerDrift,
    /// The server refused a queued write as conflicting
    WriteRejected,
}

/// Resolution applied to a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ServerWins,
    ClientWins,
    Manual,
}

/// Lifecycle of a stored conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

str_enum!(ConflictType {
    Approval => "approval",
    DuplicateSubmission => "duplicate_submission",
    ServerDrift => "server_drift",
    WriteRejected => "write_rejected",
});

str_enum!(ResolutionStrategy {
    ServerWins => "server_wins",
    ClientWins => "client_wins",
    Manual => "manual",
});

str_enum!(ConflictStatus {
    Pending => "pending",
    Resolved => "resolved",
});

/// A classified divergence between a local mirror row and the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Storage id; zero until persisted
    pub id: i64,
    pub kind: ResourceKind,
    /// Local mirror row the conflict applies to
    pub entity_id: String,
    pub local_value: serde_json::Value,
    /// Server-confirmed value, when the server sent one
    pub server_value: Option<serde_json::Value>,
    /// Server id of the confirmed record
    pub server_id: Option<String>,
    /// Server timestamp of `server_value` (Unix ms)
    pub server_updated_at: Option<i64>,
    pub conflict_type: ConflictType,
    pub strategy: ResolutionStrategy,
    /// Human-readable explanation for operators
    pub explanation: String,
    pub status: ConflictStatus,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}
