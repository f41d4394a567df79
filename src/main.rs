//! relaycore - transparent relay with pooled tunnel transports

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use relaycore::app::Runtime;
use relaycore::config::Config;
use relaycore::error::Result;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "relaycore", version, about = "Transparent relay with pooled tunnel transports")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    test: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        let json = serde_json::to_string_pretty(&Config::default_example())
            .map_err(|e| relaycore::Error::Config(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default_example(),
    };

    if args.test {
        config.validate()?;
        println!("Configuration OK");
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if args.config.is_none() {
        info!("No config file specified, using the example config");
    }
    info!("relaycore v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(&config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}
