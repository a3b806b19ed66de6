//! Sync tuning knobs shared by the engine, the scheduler and the CLI.
//!
//! Every field has a default so partial JSON files stay valid as new knobs
//! are added.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::DEFAULT_MAX_RETRIES;
use crate::util::{is_http_url, normalize_text_option};

/// Portal used when nothing else is configured
pub const DEFAULT_API_BASE_URL: &str = "https://hr-leave-portal.vercel.app";

/// Local hours during which the scheduler stays idle.
///
/// `start_hour == end_hour` is an empty window. A window whose start is later
/// than its end wraps midnight (`22..6` covers 22:00 through 05:59).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl QuietHours {
    pub const fn contains(self, hour: u8) -> bool {
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Sync settings (serialized as JSON by the CLI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_base_url: String,
    /// Queue entries drained per push pass, fixed at cycle start
    pub batch_size: usize,
    pub default_max_retries: i64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Scheduler tick before power-source adjustment
    pub base_interval_secs: u64,
    /// With an empty queue, pull anyway once the checkpoint is this old
    pub pull_overdue_secs: u64,
    pub quiet_hours: Option<QuietHours>,
    pub retry_backoff_base_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub pull_timeout_secs: u64,
    pub push_timeout_secs: u64,
    pub compression_enabled: bool,
    /// Request bodies at least this large are gzipped
    pub compression_threshold: usize,
    /// Cached GET bodies older than this are served stale and refreshed
    pub cache_max_age_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            batch_size: 50,
            default_max_retries: DEFAULT_MAX_RETRIES,
            min_interval_secs: 60,
            max_interval_secs: 3_600,
            base_interval_secs: 300,
            pull_overdue_secs: 900,
            quiet_hours: None,
            retry_backoff_base_secs: 30,
            retry_backoff_max_secs: 1_800,
            pull_timeout_secs: 30,
            push_timeout_secs: 60,
            compression_enabled: true,
            compression_threshold: 1_024,
            cache_max_age_secs: 300,
        }
    }
}

impl SyncSettings {
    /// Reject settings that would make the engine or scheduler misbehave.
    pub fn validate(&self) -> Result<()> {
        let Some(url) = normalize_text_option(Some(self.api_base_url.clone())) else {
            return Err(Error::InvalidInput("api_base_url must not be empty".to_string()));
        };
        if !is_http_url(&url) {
            return Err(Error::InvalidInput(format!(
                "api_base_url must include http:// or https://, got {url}"
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.default_max_retries < 1 {
            return Err(Error::InvalidInput(
                "default_max_retries must be at least 1".to_string(),
            ));
        }
        if self.min_interval_secs > self.max_interval_secs {
            return Err(Error::InvalidInput(format!(
                "min_interval_secs ({}) exceeds max_interval_secs ({})",
                self.min_interval_secs, self.max_interval_secs
            )));
        }
        if self.retry_backoff_base_secs > self.retry_backoff_max_secs {
            return Err(Error::InvalidInput(format!(
                "retry_backoff_base_secs ({}) exceeds retry_backoff_max_secs ({})",
                self.retry_backoff_base_secs, self.retry_backoff_max_secs
            )));
        }
        if let Some(quiet) = self.quiet_hours {
            if quiet.start_hour > 23 || quiet.end_hour > 23 {
                return Err(Error::InvalidInput(
                    "quiet_hours must use hours 0-23".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Base URL without a trailing slash
    pub fn api_base(&self) -> &str {
        self.api_base_url.trim().trim_end_matches('/')
    }

    pub const fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub const fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub const fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub const fn pull_overdue(&self) -> Duration {
        Duration::from_secs(self.pull_overdue_secs)
    }

    pub const fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    /// Per-entry backoff bounds in milliseconds
    pub const fn backoff_millis(&self) -> (i64, i64) {
        (
            secs_to_millis(self.retry_backoff_base_secs),
            secs_to_millis(self.retry_backoff_max_secs),
        )
    }

    /// Scheduler period: doubled on battery, clamped to the interval bounds.
    pub fn tick_interval(&self, on_battery: bool) -> Duration {
        let base = if on_battery {
            self.base_interval_secs.saturating_mul(2)
        } else {
            self.base_interval_secs
        };
        let secs = base.clamp(
            self.min_interval_secs,
            self.max_interval_secs.max(self.min_interval_secs),
        );
        Duration::from_secs(secs)
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn secs_to_millis(secs: u64) -> i64 {
    let millis = secs.saturating_mul(1_000);
    if millis > i64::MAX as u64 {
        i64::MAX
    } else {
        millis as i64
    }
}
