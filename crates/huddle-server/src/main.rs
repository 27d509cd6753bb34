//! # Huddle Server
//!
//! Presence and message router.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file from the default search paths
//! HUDDLE_DID=did:web:router.example.com huddle
//!
//! # Run with a specific config file
//! huddle --config /path/to/huddle.toml
//!
//! # Run with environment variables
//! HUDDLE_PORT=8080 HUDDLE_HOST=0.0.0.0 HUDDLE_DID=did:web:router.example.com huddle
//! ```

use anyhow::Result;
use clap::Parser;
use huddle_server::{handlers, metrics, Config};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "huddle", version, about = "Presence and message router")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;
    config.validate()?;

    tracing::info!("Starting Huddle server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
