//! Hypertube CLI - Command-line interface
//!
//! Runs the streaming server and inspects downloads persisted on disk.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hypertube_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "hypertube")]
#[command(about = "Stream torrents over HTTP while they download")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full-trace run log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("Failed to initialize tracing")?;

    commands::handle_command(cli.command).await
}
