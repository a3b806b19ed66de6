use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use hrsync_core::cache::ResponseCache;
use hrsync_core::config::SyncSettings;
use hrsync_core::models::{ConflictRecord, DeadLetterEntry, QueueEntry, QueueHeaders};
use hrsync_core::remote::{HttpRemote, StaticToken};
use hrsync_core::services::DatabaseService;
use hrsync_core::sync::SyncEngine;

use crate::config::{load_settings, resolve_config_path, resolve_db_path};
use crate::credentials::{resolve_token, TOKEN_ENV};
use crate::error::CliError;

/// Paths the commands work against
#[derive(Debug, Clone)]
pub struct CliContext {
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl CliContext {
    pub fn resolve(
        db_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, CliError> {
        Ok(Self {
            db_path: resolve_db_path(db_path)?,
            config_path: resolve_config_path(config_path)?,
        })
    }

    pub fn settings(&self) -> Result<SyncSettings, CliError> {
        load_settings(&self.config_path)
    }

    pub async fn open_database(&self) -> Result<DatabaseService, CliError> {
        open_database(&self.db_path).await
    }

    /// Engine with the response cache attached so pushes invalidate it.
    pub async fn engine(&self) -> Result<SyncEngine, CliError> {
        let settings = self.settings()?;
        let db = self.open_database().await?;
        let cache = ResponseCache::with_database(db.clone(), settings.cache_max_age());
        Ok(SyncEngine::new(db, settings)?.with_cache(cache))
    }
}

pub async fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(path.to_path_buf()).await?)
}

/// HTTP client for the configured portal. Fails without a credential.
pub fn authenticated_remote(settings: &SyncSettings) -> Result<Arc<HttpRemote>, CliError> {
    let Some((token, source)) = resolve_token(env::var(TOKEN_ENV).ok())? else {
        return Err(CliError::NotAuthenticated);
    };
    tracing::debug!("Using API credential from {source:?}");
    let credentials = Arc::new(StaticToken::new(Some(token)));
    Ok(Arc::new(HttpRemote::new(settings, credentials)?))
}

/// `NAME=VALUE` pairs into a header map.
pub fn parse_headers(raw: &[String]) -> Result<Option<QueueHeaders>, CliError> {
    if raw.is_empty() {
        return Ok(None);
    }

    let mut headers = QueueHeaders::new();
    for pair in raw {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(CliError::InvalidArgument(format!(
                "header `{pair}` must look like NAME=VALUE"
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(CliError::InvalidArgument(format!(
                "header `{pair}` has an empty name"
            )));
        }
        headers.insert(name.to_string(), value.trim().to_string());
    }
    Ok(Some(headers))
}

/// Payload argument, else piped stdin, else an empty object.
pub fn resolve_payload(raw: Option<&str>) -> Result<serde_json::Value, CliError> {
    let text = match raw {
        Some(raw) => Some(raw.to_string()),
        None => read_piped_stdin()?,
    };
    match text.as_deref().map(str::trim) {
        None | Some("") => Ok(serde_json::json!({})),
        Some(text) => serde_json::from_str(text).map_err(|error| {
            CliError::InvalidArgument(format!("payload is not valid JSON: {error}"))
        }),
    }
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(Some(buffer))
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn format_queue_lines(entries: &[QueueEntry]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    entries
        .iter()
        .map(|entry| {
            let mut line = format!(
                "{}  p{:<3} {:<6} {:<13} {:<24} retries={}/{}  {}",
                entry.id,
                entry.priority,
                entry.method.as_str(),
                entry.kind.as_str(),
                entry.record_id,
                entry.retries,
                entry.max_retries,
                format_relative_time(entry.created_at, now_ms)
            );
            if let Some(error) = &entry.last_error {
                line.push_str(&format!("  last_error={error}"));
            }
            line
        })
        .collect()
}

pub fn format_dead_letter_lines(entries: &[DeadLetterEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|dead| {
            format!(
                "{}  {}  {} {} {}  after {} attempts: {}",
                format_timestamp(dead.failed_at),
                dead.entry.id,
                dead.entry.method,
                dead.entry.kind,
                dead.entry.record_id,
                dead.retry_count,
                dead.error_message
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "#{:<5} {}  {:<20} {:<11} {} {}  [{}]  {}",
                conflict.id,
                format_timestamp(conflict.detected_at),
                conflict.conflict_type.as_str(),
                conflict.strategy.as_str(),
                conflict.kind,
                conflict.entity_id,
                conflict.status,
                conflict.explanation
            )
        })
        .collect()
}
