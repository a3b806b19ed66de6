//! Bearer token persistence in the OS keychain.

#[cfg(test)]
use std::sync::Mutex;

#[cfg(not(test))]
use keyring::Entry;

use hrsync_core::util::normalize_text_option;

use crate::error::CliError;

pub const TOKEN_ENV: &str = "HRSYNC_TOKEN";

#[cfg(not(test))]
const KEYRING_SERVICE_NAME: &str = "hrsync-cli";
#[cfg(not(test))]
const KEYRING_USERNAME: &str = "api_token";

#[cfg(test)]
static TEST_TOKEN: Mutex<Option<String>> = Mutex::new(None);

#[cfg(not(test))]
fn entry() -> Result<Entry, CliError> {
    Entry::new(KEYRING_SERVICE_NAME, KEYRING_USERNAME)
        .map_err(|error| CliError::Credentials(error.to_string()))
}

#[cfg(not(test))]
pub fn load_stored_token() -> Result<Option<String>, CliError> {
    match entry()?.get_password() {
        Ok(token) => Ok(normalize_text_option(Some(token))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(error) => Err(CliError::Credentials(error.to_string())),
    }
}

#[cfg(test)]
pub fn load_stored_token() -> Result<Option<String>, CliError> {
    TEST_TOKEN
        .lock()
        .map(|token| token.clone())
        .map_err(|error| CliError::Credentials(error.to_string()))
}

#[cfg(not(test))]
pub fn store_token(token: &str) -> Result<(), CliError> {
    entry()?
        .set_password(token)
        .map_err(|error| CliError::Credentials(error.to_string()))
}

#[cfg(test)]
pub fn store_token(token: &str) -> Result<(), CliError> {
    let mut guard = TEST_TOKEN
        .lock()
        .map_err(|error| CliError::Credentials(error.to_string()))?;
    *guard = Some(token.to_string());
    Ok(())
}

#[cfg(not(test))]
pub fn clear_token() -> Result<(), CliError> {
    match entry()?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(error) => Err(CliError::Credentials(error.to_string())),
    }
}

#[cfg(test)]
pub fn clear_token() -> Result<(), CliError> {
    let mut guard = TEST_TOKEN
        .lock()
        .map_err(|error| CliError::Credentials(error.to_string()))?;
    *guard = None;
    Ok(())
}

/// Where the active credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Environment,
    Keychain,
}

/// `HRSYNC_TOKEN` wins over the keychain.
pub fn resolve_token(env_token: Option<String>) -> Result<Option<(String, TokenSource)>, CliError> {
    if let Some(token) = normalize_text_option(env_token) {
        return Ok(Some((token, TokenSource::Environment)));
    }
    Ok(load_stored_token()?.map(|token| (token, TokenSource::Keychain)))
}

/// Trim and drop an optional `Bearer` scheme; the bare scheme is rejected.
pub fn normalize_token(token: &str) -> Result<String, CliError> {
    let token = strip_bearer(token.trim()).trim();
    if token.is_empty() {
        return Err(CliError::InvalidArgument("token cannot be empty".to_string()));
    }
    Ok(token.to_string())
}

fn strip_bearer(token: &str) -> &str {
    match (token.get(..6), token.get(6..)) {
        (Some(scheme), Some(rest))
            if scheme.eq_ignore_ascii_case("bearer")
                && rest.chars().next().is_none_or(char::is_whitespace) =>
        {
            rest
        }
        _ => token,
    }
}
