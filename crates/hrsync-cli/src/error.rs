use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] hrsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Credential storage error: {0}")]
    Credentials(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error(
        "No API credential. Run `hrsync auth login --token <TOKEN>` or set HRSYNC_TOKEN."
    )]
    NotAuthenticated,
}
