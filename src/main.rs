//! openchamber-sync - OpenCode event stream client
//!
#![doc = "openchamber-sync - OpenCode event stream client"]
#![doc = "Main entry point for the openchamber-sync application."]

use anyhow::Result;

use openchamber_sync::cli::{Cli, Commands};
use openchamber_sync::commands;
use openchamber_sync::config::Config;
use openchamber_sync::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    init_logging(&config.logging)?;
    openchamber_sync::metrics::init_metrics_exporter();

    // Execute command
    match cli.command.unwrap_or(Commands::Watch { session: None }) {
        Commands::Watch { session } => {
            tracing::info!("Starting watch mode");
            commands::watch::run_watch(config, session).await?;
            Ok(())
        }
        Commands::Resync { session } => {
            tracing::info!(session_id = %session, "Starting one-shot resync");
            commands::resync::run_resync(config, session).await?;
            Ok(())
        }
        Commands::Status => {
            commands::status::show_status(&config).await?;
            Ok(())
        }
        Commands::Health => {
            commands::status::check_health(&config).await?;
            Ok(())
        }
        Commands::Cursor { session } => {
            commands::cursor::show_cursor(&config, &session)?;
            Ok(())
        }
    }
}
