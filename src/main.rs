//! Recon Orchestrator
//!
//! Main entry point. Parses the command line, loads configuration,
//! initializes logging and runs the requested command.
//!
//! Copyright (c) 2025 Deepskilling Inc
//! Licensed under the MIT License (https://opensource.org/licenses/MIT)

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use recon_orchestrator::{cli::Cli, config::AppConfig, core::Application, logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.validate().map_err(|e| anyhow!(e))?;

    let mut config = AppConfig::load(&cli.config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config_path.display()))?;
    if let Some(level) = cli.log_level_override() {
        config.logging.level = level.to_string();
    }

    // The guard flushes the file writer on exit.
    let _log_guard = logging::init_logging_with_config(&config.logging)?;

    info!("Starting recon_orchestrator {}", env!("CARGO_PKG_VERSION"));

    let app = Application::new(config).await?;
    app.run(cli).await?;

    info!("Application completed successfully");
    Ok(())
}
