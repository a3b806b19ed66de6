//! Reports and status snapshots exposed to the UI layer

use serde::{Deserialize, Serialize};

use crate::state::SyncState;

/// Result of one pull pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    pub employees_pulled: usize,
    pub balances_pulled: usize,
    pub leave_requests_pulled: usize,
    /// Mirror rows hard-deleted by server tombstones
    pub tombstones_applied: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
}

impl PullReport {
    pub const fn total_pulled(&self) -> usize {
        self.employees_pulled + self.balances_pulled + self.leave_requests_pulled
    }
}

/// Result of one push pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub pushed: usize,
    /// Attempts that failed, including those that were then dead-lettered
    pub failed: usize,
    pub dead_lettered: usize,
    /// Entries left for a later cycle (backoff or an earlier write of the
    /// same record did not go through)
    pub skipped: usize,
    /// Entries the server rejected as conflicting
    pub conflicts: usize,
}

/// Pull followed by push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub pull: PullReport,
    pub push: PushReport,
}

/// What the UI can always query, online or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    pub state: SyncState,
    pub pending_count: usize,
    pub dead_letter_count: usize,
    pub manual_conflict_count: usize,
    /// Checkpoint of the last successful pull (Unix ms)
    pub last_sync_at: Option<i64>,
    pub in_progress: bool,
}
