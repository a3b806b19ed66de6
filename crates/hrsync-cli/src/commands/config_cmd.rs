use hrsync_core::config::SyncSettings;
use hrsync_core::util::normalize_text_option;

use crate::cli::ConfigCommands;
use crate::commands::common::CliContext;
use crate::config::{load_settings_from_path, save_settings};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, context: &CliContext) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            let settings = context.settings()?;
            println!("# {}", context.config_path.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigCommands::Init {
            api_base_url,
            force,
        } => {
            let path = &context.config_path;
            if path.exists() && !force {
                return Err(CliError::Config(format!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                )));
            }
            let base = if path.exists() {
                load_settings_from_path(path)?
            } else {
                SyncSettings::default()
            };
            let settings = init_settings(base, api_base_url);
            save_settings(&settings, path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

pub fn init_settings(mut settings: SyncSettings, api_base_url: Option<String>) -> SyncSettings {
    if let Some(url) = normalize_text_option(api_base_url) {
        settings.api_base_url = url;
    }
    settings
}
