use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use imgflow::cli::{self, Cli};
use imgflow::config::{config_file_path, EngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Provider credentials may live in a .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load_from(&config_file_path())?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    cli::execute(cli, config).await
}
