pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod integration;
pub mod job;
pub mod model;
pub mod ports;
pub mod search;
pub mod sources;
pub mod stats;
pub mod status;
pub mod watermark;

#[cfg(test)]
mod testing;

use std::path::PathBuf;

use anyhow::Result;

pub use cli::Cli;

/// Default data directory: `<data dir>/space-indexer`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("space-indexer")
}

/// Library entrypoint; dispatches the parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    cli::execute(cli).await
}
