use hrsync_core::cache::{CacheLookup, ResponseCache};
use hrsync_core::models::HttpMethod;
use hrsync_core::remote::RemoteApi;

use crate::cli::CacheCommands;
use crate::commands::common::{authenticated_remote, CliContext};
use crate::error::CliError;

pub async fn run_cache(command: CacheCommands, context: &CliContext) -> Result<(), CliError> {
    let settings = context.settings()?;
    let db = context.open_database().await?;
    let cache = ResponseCache::with_database(db, settings.cache_max_age());

    match command {
        CacheCommands::Get { path } => {
            let remote = authenticated_remote(&settings)?;
            let timeout = settings.pull_timeout();
            let fetch_path = path.clone();
            let lookup = cache
                .get_or_refresh(&path, move || async move {
                    Ok::<_, hrsync_core::Error>(remote.get(&fetch_path, timeout).await?)
                })
                .await?;

            let label = lookup_label(&lookup);
            let body = match lookup {
                CacheLookup::Stale {
                    body,
                    refresh: Some(refresh),
                } => {
                    // The process exits after printing; let the refresh land first
                    if let Err(error) = refresh.await {
                        tracing::warn!("Cache refresh task failed: {error}");
                    }
                    body
                }
                other => other.into_body(),
            };
            tracing::info!("{path}: {label}");
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        CacheCommands::Clear { path: Some(path) } => {
            let removed = cache.clear(HttpMethod::Get, &path).await?;
            println!(
                "{}",
                if removed {
                    format!("Cleared cached response for {path}")
                } else {
                    format!("Nothing cached for {path}")
                }
            );
        }
        CacheCommands::Clear { path: None } => {
            let removed = cache.clear_all().await?;
            println!("Cleared {removed} cached responses");
        }
    }
    Ok(())
}

pub const fn lookup_label(lookup: &CacheLookup) -> &'static str {
    match lookup {
        CacheLookup::Fresh(_) => "fresh from cache",
        CacheLookup::Stale { .. } => "stale from cache, refreshed in background",
        CacheLookup::Fetched(_) => "fetched from server",
    }
}
