//! Lakehouse CLI: land scraped documents, promote them through the
//! RAW → CLEANED → CURATED stages and keep the vector index in sync.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
