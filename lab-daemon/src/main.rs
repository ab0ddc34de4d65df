use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod commands;
mod daemon;
mod services;

use cli::Args;
use commands::execute_command;

#[tokio::main]
async fn main() -> Result<()> {
    // Kept alive so the file writer flushes on exit.
    let _log_guard = lab_logging::init_subscriber();

    let args = Args::parse();
    debug!(command = ?args.command, "Starting labd");

    execute_command(args).await
}
