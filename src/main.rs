//! dlmm-keeper - automated DLMM liquidity keeper for Solana

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use dlmm_keeper::adapters::cli::{self, CliApp};
use dlmm_keeper::config::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (secrets go here, not in config.toml)
    dotenvy::dotenv().ok();

    let app = CliApp::parse();
    let config = load_config(&app.config)
        .with_context(|| format!("Failed to load configuration from {}", app.config.display()))?;

    init_logging(app.verbose, app.debug, &config.logging.level);
    tracing::debug!(config = %app.config.display(), "Configuration loaded");

    cli::execute(app, config).await
}

/// `RUST_LOG` wins; otherwise --debug, --verbose, then the configured level
fn init_logging(verbose: bool, debug: bool, configured: &str) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        configured
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt().with_env_filter(filter).with_target(false).init();
}
