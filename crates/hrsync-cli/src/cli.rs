use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "hrsync")]
#[command(about = "Offline write queue and sync for the HR leave portal")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the settings file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect or edit the write queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Inspect quarantined writes
    #[command(name = "dead-letter", alias = "dlq")]
    DeadLetter {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Read through or clear the response cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Show queue, dead-letter and conflict counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Synchronize with the portal
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Manage the API credential
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Show or initialize settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    /// Keep the server value
    Server,
    /// Keep the local value and push it again
    Client,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Queue a write, e.g. `hrsync queue add POST /api/leaves '{"staff_id":"s1"}'`
    Add {
        /// HTTP method (POST, PUT, PATCH, DELETE)
        method: String,
        /// Request path under the API base
        path: String,
        /// JSON body (read from stdin when omitted and piped)
        payload: Option<String>,
        /// Extra request header as NAME=VALUE
        #[arg(long = "header", value_name = "NAME=VALUE")]
        headers: Vec<String>,
        /// Higher priority entries are pushed first
        #[arg(long, default_value = "0")]
        priority: i64,
        /// Attempts before the entry is quarantined
        #[arg(long)]
        max_retries: Option<i64>,
    },
    /// List queued writes in push order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove one queued write
    Remove {
        /// Queue entry ID
        id: String,
    },
    /// Remove every queued write
    Clear,
}

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// List quarantined writes, newest first
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move an entry back to the queue with a fresh retry budget
    Requeue {
        /// Queue entry ID
        id: String,
    },
    /// Delete one quarantined entry
    Purge {
        /// Queue entry ID
        id: String,
    },
    /// Delete every quarantined entry
    Clear,
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts waiting for a decision
    List {
        /// Show recent conflicts of every status instead
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show with --all
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a pending conflict
    Resolve {
        /// Conflict ID
        id: i64,
        /// Which side wins
        #[arg(value_enum)]
        strategy: StrategyArg,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// GET a path through the cache, refreshing stale entries
    Get {
        /// Request path with optional query string
        path: String,
    },
    /// Drop cached responses for one path, or all of them
    Clear {
        /// Request path; clears everything when omitted
        path: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Pull then push once (default)
    Once,
    /// Pull server changes only
    Pull,
    /// Push queued writes only
    Push,
    /// Run the background scheduler until interrupted
    Daemon,
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Store a bearer token in the OS keychain
    Login {
        /// Bearer token issued by the portal
        #[arg(long, value_name = "TOKEN")]
        token: String,
    },
    /// Show whether a credential is available
    Status,
    /// Remove the stored token
    Logout,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective settings
    Show,
    /// Write a settings file with defaults
    Init {
        /// API base URL of the portal
        #[arg(long, value_name = "URL")]
        api_base_url: Option<String>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
