//! Settings file and local paths.

use std::env;
use std::path::{Path, PathBuf};

use hrsync_core::config::SyncSettings;
use hrsync_core::util::normalize_text_option;

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "config.json";
const API_URL_ENV: &str = "HRSYNC_API_URL";
const DB_PATH_ENV: &str = "HRSYNC_DB_PATH";

pub fn default_config_path() -> Result<PathBuf, CliError> {
    dirs::config_dir()
        .map(|dir| dir.join("hrsync").join(CONFIG_FILE_NAME))
        .ok_or_else(|| CliError::Config("failed to resolve the config directory".to_string()))
}

pub fn resolve_config_path(cli_config: Option<PathBuf>) -> Result<PathBuf, CliError> {
    cli_config.map_or_else(default_config_path, Ok)
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from)) {
        return Ok(path);
    }
    dirs::data_dir()
        .map(|dir| dir.join("hrsync").join("hrsync.db"))
        .ok_or_else(|| CliError::Config("failed to resolve the data directory".to_string()))
}

/// Read settings from `path`; a missing file means defaults.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings, CliError> {
    if !path.exists() {
        return Ok(SyncSettings::default());
    }

    let raw = std::fs::read_to_string(path).map_err(|error| {
        CliError::Config(format!("failed to read {}: {error}", path.display()))
    })?;
    serde_json::from_str(&raw)
        .map_err(|error| CliError::Config(format!("failed to parse {}: {error}", path.display())))
}

/// Settings file plus environment overrides, validated.
pub fn load_settings(path: &Path) -> Result<SyncSettings, CliError> {
    let mut settings = load_settings_from_path(path)?;
    apply_env_overrides(&mut settings, env::var(API_URL_ENV).ok());
    settings.validate()?;
    Ok(settings)
}

pub fn apply_env_overrides(settings: &mut SyncSettings, api_url: Option<String>) {
    if let Some(api_url) = normalize_text_option(api_url) {
        tracing::debug!("Using API base URL from {API_URL_ENV}");
        settings.api_base_url = api_url;
    }
}

pub fn save_settings(settings: &SyncSettings, path: &Path) -> Result<(), CliError> {
    settings.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
