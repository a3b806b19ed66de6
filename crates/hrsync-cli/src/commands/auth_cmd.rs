use std::env;

use crate::cli::AuthCommands;
use crate::credentials::{
    clear_token, normalize_token, resolve_token, store_token, TokenSource, TOKEN_ENV,
};
use crate::error::CliError;

pub fn run_auth(command: AuthCommands) -> Result<(), CliError> {
    match command {
        AuthCommands::Login { token } => {
            store_token(&normalize_token(&token)?)?;
            println!("Stored API token in the system keychain");
        }
        AuthCommands::Status => {
            let source = resolve_token(env::var(TOKEN_ENV).ok())?.map(|(_, source)| source);
            println!("{}", describe_token(source));
        }
        AuthCommands::Logout => {
            clear_token()?;
            println!("Removed stored API token");
            if env::var_os(TOKEN_ENV).is_some() {
                println!("{TOKEN_ENV} is still set in the environment");
            }
        }
    }
    Ok(())
}

pub fn describe_token(source: Option<TokenSource>) -> String {
    match source {
        Some(TokenSource::Environment) => format!("Authenticated via {TOKEN_ENV}"),
        Some(TokenSource::Keychain) => "Authenticated via the system keychain".to_string(),
        None => "Not authenticated".to_string(),
    }
}
