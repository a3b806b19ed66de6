use hrsync_core::models::{HttpMethod, NewQueueEntry, QueueEntryId};

use crate::cli::QueueCommands;
use crate::commands::common::{format_queue_lines, parse_headers, resolve_payload, CliContext};
use crate::error::CliError;

pub async fn run_queue(command: QueueCommands, context: &CliContext) -> Result<(), CliError> {
    match command {
        QueueCommands::Add {
            method,
            path,
            payload,
            headers,
            priority,
            max_retries,
        } => {
            let entry = build_entry(
                &method,
                &path,
                payload.as_deref(),
                &headers,
                priority,
                max_retries,
            )?;
            let engine = context.engine().await?;
            let entry = match max_retries {
                Some(_) => entry,
                None => entry.with_max_retries(engine.settings().default_max_retries),
            };
            let queued = engine.apply_local_write(entry).await?;
            println!(
                "Queued {} {} {} as {}",
                queued.method, queued.kind, queued.record_id, queued.id
            );
            Ok(())
        }
        QueueCommands::List { json } => {
            let db = context.open_database().await?;
            let entries = db.list_queue().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("Write queue is empty.");
            } else {
                for line in format_queue_lines(&entries) {
                    println!("{line}");
                }
            }
            Ok(())
        }
        QueueCommands::Remove { id } => {
            let id = parse_entry_id(&id)?;
            let db = context.open_database().await?;
            if db.dequeue(&id).await? {
                println!("Removed {id}");
                Ok(())
            } else {
                Err(hrsync_core::Error::NotFound(format!("queue entry {id}")).into())
            }
        }
        QueueCommands::Clear => {
            let db = context.open_database().await?;
            let removed = db.clear_queue().await?;
            println!("Removed {removed} queued writes");
            Ok(())
        }
    }
}

/// Parse CLI arguments into a queue entry; GET and unknown paths are refused.
pub fn build_entry(
    method: &str,
    path: &str,
    payload: Option<&str>,
    headers: &[String],
    priority: i64,
    max_retries: Option<i64>,
) -> Result<NewQueueEntry, CliError> {
    let method = method.parse::<HttpMethod>()?;
    let payload = resolve_payload(payload)?;
    let headers = parse_headers(headers)?;

    let mut entry =
        NewQueueEntry::from_request(method, path, payload, headers)?.with_priority(priority);
    if let Some(max_retries) = max_retries {
        if max_retries < 1 {
            return Err(CliError::InvalidArgument(
                "--max-retries must be at least 1".to_string(),
            ));
        }
        entry = entry.with_max_retries(max_retries);
    }
    Ok(entry)
}

pub fn parse_entry_id(raw: &str) -> Result<QueueEntryId, CliError> {
    raw.trim()
        .parse::<QueueEntryId>()
        .map_err(|_| CliError::InvalidArgument(format!("`{raw}` is not a queue entry id")))
}
