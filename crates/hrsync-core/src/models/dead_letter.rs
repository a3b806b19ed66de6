//! Dead-letter model

use serde::{Deserialize, Serialize};

use super::QueueEntry;

/// Snapshot of a queued write that exhausted its retry budget.
///
/// Dead letters are never retried automatically; an operator either requeues
/// or purges them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The queue entry as it was when quarantined
    pub entry: QueueEntry,
    /// Error of the final attempt
    pub error_message: String,
    /// Attempts made before quarantine
    pub retry_count: i64,
    /// Quarantine timestamp (Unix ms)
    pub failed_at: i64,
}
