use hrsync_core::conflict::{ConflictResolver, ResolutionOutcome};
use hrsync_core::models::ResolutionStrategy;

use crate::cli::{ConflictCommands, StrategyArg};
use crate::commands::common::{format_conflict_lines, CliContext};
use crate::error::CliError;

pub async fn run_conflicts(
    command: ConflictCommands,
    context: &CliContext,
) -> Result<(), CliError> {
    let db = context.open_database().await?;
    match command {
        ConflictCommands::List { all, limit, json } => {
            let conflicts = if all {
                db.recent_conflicts(limit).await?
            } else {
                db.pending_manual_conflicts().await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&conflicts)?);
            } else if conflicts.is_empty() {
                println!("No conflicts waiting for a decision.");
            } else {
                for line in format_conflict_lines(&conflicts) {
                    println!("{line}");
                }
            }
        }
        ConflictCommands::Resolve { id, strategy } => {
            let resolver = ConflictResolver::new(db);
            let outcome = resolver.resolve_with(id, strategy_from_arg(strategy)).await?;
            println!("Conflict #{id}: {}", describe_outcome(outcome));
        }
    }
    Ok(())
}

pub const fn strategy_from_arg(strategy: StrategyArg) -> ResolutionStrategy {
    match strategy {
        StrategyArg::Server => ResolutionStrategy::ServerWins,
        StrategyArg::Client => ResolutionStrategy::ClientWins,
    }
}

pub const fn describe_outcome(outcome: ResolutionOutcome) -> &'static str {
    match outcome {
        ResolutionOutcome::ServerApplied => "server value applied",
        ResolutionOutcome::DuplicateDiscarded => "local duplicate discarded",
        ResolutionOutcome::ClientRequeued => "local value queued for push",
        ResolutionOutcome::Deferred => "left for manual review",
    }
}
