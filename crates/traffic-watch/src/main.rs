mod bootstrap;
mod cli;
mod commands;
mod driver;
mod scheduler;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::init_tracing;
use crate::cli::Cli;
use crate::commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}
