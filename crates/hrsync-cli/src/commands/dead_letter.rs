use crate::cli::DeadLetterCommands;
use crate::commands::common::{format_dead_letter_lines, CliContext};
use crate::commands::queue::parse_entry_id;
use crate::error::CliError;

pub async fn run_dead_letter(
    command: DeadLetterCommands,
    context: &CliContext,
) -> Result<(), CliError> {
    let db = context.open_database().await?;
    match command {
        DeadLetterCommands::List { limit, json } => {
            let entries = db.list_dead_letters(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No quarantined writes.");
            } else {
                for line in format_dead_letter_lines(&entries) {
                    println!("{line}");
                }
            }
        }
        DeadLetterCommands::Requeue { id } => {
            let id = parse_entry_id(&id)?;
            db.requeue_dead_letter(&id).await?;
            println!("Requeued {id}");
        }
        DeadLetterCommands::Purge { id } => {
            let id = parse_entry_id(&id)?;
            if !db.purge_dead_letter(&id).await? {
                return Err(hrsync_core::Error::NotFound(format!("dead-letter entry {id}")).into());
            }
            println!("Purged {id}");
        }
        DeadLetterCommands::Clear => {
            let removed = db.clear_dead_letters().await?;
            println!("Purged {removed} quarantined writes");
        }
    }
    Ok(())
}
