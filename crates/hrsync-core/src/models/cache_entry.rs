//! Cached GET response model

use serde::{Deserialize, Serialize};

/// A cached response body. Disposable: wiping every entry is always safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `METHOD path?query` with a normalized path and sorted query
    pub key: String,
    pub method: String,
    pub path: String,
    pub body: serde_json::Value,
    /// Time the body was stored (Unix ms)
    pub timestamp: i64,
    /// Hard expiry (Unix ms); the entry is dropped once it passes
    pub expires_at: Option<i64>,
}

impl CacheEntry {
    /// Age relative to `now` in milliseconds.
    pub const fn age_ms(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}
