use chrono::Utc;
use serde::Serialize;

use hrsync_core::sync::SyncStatusSnapshot;

use crate::commands::common::{format_relative_time, format_timestamp, CliContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusItem {
    #[serde(flatten)]
    pub snapshot: SyncStatusSnapshot,
    pub last_sync_at_iso: Option<String>,
    pub last_push_at: Option<i64>,
    pub api_base_url: String,
}

pub async fn run_status(as_json: bool, context: &CliContext) -> Result<(), CliError> {
    let engine = context.engine().await?;
    let snapshot = engine.status().await?;
    let last_push_at = engine.database().last_push_at().await?;
    let item = StatusItem {
        last_sync_at_iso: snapshot.last_sync_at.map(format_timestamp),
        snapshot,
        last_push_at,
        api_base_url: engine.settings().api_base().to_string(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    for line in format_status_lines(&item, Utc::now().timestamp_millis()) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(item: &StatusItem, now_ms: i64) -> Vec<String> {
    let since = |timestamp: Option<i64>| {
        timestamp.map_or_else(
            || "never".to_string(),
            |timestamp| {
                format!(
                    "{} ({})",
                    format_timestamp(timestamp),
                    format_relative_time(timestamp, now_ms)
                )
            },
        )
    };

    vec![
        format!("API:               {}", item.api_base_url),
        format!("Pending writes:    {}", item.snapshot.pending_count),
        format!("Dead letters:      {}", item.snapshot.dead_letter_count),
        format!("Manual conflicts:  {}", item.snapshot.manual_conflict_count),
        format!("Last pull:         {}", since(item.snapshot.last_sync_at)),
        format!("Last push:         {}", since(item.last_push_at)),
    ]
}
