// Plughub
// Main entry point for the plughub binary

use clap::Parser;
use plughub_engine::cli::{CacheAction, Cli, Command};
use plughub_engine::config::Config;
use plughub_engine::handlers::{
    handle_cache_list, handle_cache_purge, handle_check_updates, handle_list, handle_resolve,
    OutputFormat,
};
use plughub_engine::session::Session;
use plughub_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let mut config = if let Some(config_path) = &cli.config {
        Config::load_or_create_at(config_path)?
    } else {
        Config::load_or_create()?
    };
    if let Some(source) = &cli.registry {
        config.set_registry_source(source)?;
    }

    // RUST_LOG still wins over both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    tracing::debug!("plughub v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::new(config)?;

    match cli.command {
        Command::Resolve { name, timeout } => {
            tracing::debug!("Resolving plugin: {}", name);
            handle_resolve(&session, &name, timeout, format).await
        }

        Command::List => handle_list(&session, format).await,

        Command::Cache { action } => match action {
            CacheAction::List => handle_cache_list(&session, format),
            CacheAction::Purge { name } => handle_cache_purge(&session, name.as_deref(), format),
        },

        Command::CheckUpdates { name } => {
            tracing::debug!("Checking for updates...");
            handle_check_updates(&session, name.as_deref(), format).await
        }
    }
}
