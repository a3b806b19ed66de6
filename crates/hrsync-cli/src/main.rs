//! hrsync - queue leave-portal writes offline and sync them when the portal is reachable

mod cli;
mod commands;
mod config;
mod credentials;
mod error;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::auth_cmd::run_auth;
use crate::commands::cache::run_cache;
use crate::commands::common::CliContext;
use crate::commands::completions::run_completions;
use crate::commands::config_cmd::run_config;
use crate::commands::conflicts::run_conflicts;
use crate::commands::dead_letter::run_dead_letter;
use crate::commands::queue::run_queue;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hrsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // These never touch the database or settings.
    let command = match cli.command {
        Commands::Completions { shell, output } => {
            return run_completions(shell, output.as_deref());
        }
        Commands::Auth { command } => return run_auth(command),
        command => command,
    };

    let context = CliContext::resolve(cli.db_path, cli.config)?;
    match command {
        Commands::Queue { command } => run_queue(command, &context).await,
        Commands::DeadLetter { command } => run_dead_letter(command, &context).await,
        Commands::Conflicts { command } => run_conflicts(command, &context).await,
        Commands::Cache { command } => run_cache(command, &context).await,
        Commands::Status { json } => run_status(json, &context).await,
        Commands::Sync { command } => run_sync(command, &context).await,
        Commands::Config { command } => run_config(command, &context),
        Commands::Completions { .. } | Commands::Auth { .. } => Ok(()),
    }
}
