use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use space_indexer::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .init();

    space_indexer::run(Cli::parse()).await
}
