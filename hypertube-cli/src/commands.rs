//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Subcommand, ValueEnum};
use hypertube_core::config::retention_from_days;
use hypertube_core::session::record;
use hypertube_core::swarm::SimulatedSwarm;
use hypertube_core::{HypertubeConfig, SwarmEngine};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Torrent engine behind the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// In-process swarm serving deterministic content for any link
    Simulated,
    /// Real BitTorrent downloads through librqbit (needs the `rqbit` feature)
    Rqbit,
}

/// Engine-owned files live here, next to the session directories
#[cfg(feature = "rqbit")]
const ENGINE_DIR: &str = ".engine";

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the streaming server
    Serve {
        /// Torrent engine to download with
        #[arg(long, value_enum, default_value_t = EngineKind::Simulated)]
        engine: EngineKind,
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// Root directory for downloads and session records
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Seed for simulated piece arrival order (sequential if omitted)
        #[arg(long)]
        seed: Option<u64>,
        /// Remove downloads not watched for this many days
        #[arg(long)]
        retention_days: Option<u64>,
    },
    /// List sessions persisted under the data directory
    Sessions {
        /// Root directory for downloads and session records
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            engine,
            host,
            port,
            data_dir,
            seed,
            retention_days,
        } => {
            let mut config = HypertubeConfig::from_env();
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            if let Some(seed) = seed {
                config.simulation.seed = Some(seed);
            }
            if let Some(days) = retention_days {
                let retention = retention_from_days(days).ok_or_else(|| {
                    anyhow::anyhow!("--retention-days {days} is too large")
                })?;
                config.storage.retention = Some(retention);
            }
            serve(config, engine).await
        }
        Commands::Sessions { data_dir } => {
            let data_dir = data_dir.unwrap_or_else(|| HypertubeConfig::from_env().storage.data_dir);
            list_sessions(&data_dir).await
        }
    }
}

/// Runs the server until Ctrl-C.
///
/// # Errors
/// - `std::io::Error` - The listener could not be bound
/// - `SwarmError` - The torrent engine could not start
async fn serve(config: HypertubeConfig, kind: EngineKind) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.storage.data_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create data directory {}",
                config.storage.data_dir.display()
            )
        })?;

    let engine = build_engine(&config, kind).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {e}"),
        }
        signal.cancel();
    });

    hypertube_web::run_server(config, engine, shutdown)
        .await
        .context("Streaming server failed")
}

async fn build_engine(
    config: &HypertubeConfig,
    kind: EngineKind,
) -> anyhow::Result<Arc<dyn SwarmEngine>> {
    match kind {
        EngineKind::Simulated => {
            info!(
                data_dir = %config.storage.data_dir.display(),
                seed = ?config.simulation.seed,
                "Starting in development mode with a simulated swarm"
            );
            Ok(Arc::new(SimulatedSwarm::from_config(&config.simulation)))
        }
        #[cfg(feature = "rqbit")]
        EngineKind::Rqbit => {
            let download_dir = config.storage.data_dir.join(ENGINE_DIR);
            let swarm = hypertube_core::swarm::RqbitSwarm::new(download_dir)
                .await
                .context("Failed to start librqbit")?;
            info!(data_dir = %config.storage.data_dir.display(), "Downloading with librqbit");
            Ok(Arc::new(swarm))
        }
        #[cfg(not(feature = "rqbit"))]
        EngineKind::Rqbit => {
            anyhow::bail!("This build has no librqbit engine; rebuild with `--features rqbit`")
        }
    }
}

/// Prints one line per persisted session.
///
/// # Errors
/// - `StorageError` - The data directory could not be read
async fn list_sessions(data_dir: &Path) -> anyhow::Result<()> {
    let sessions = record::list(data_dir)
        .await
        .with_context(|| format!("Failed to list sessions in {}", data_dir.display()))?;

    if sessions.is_empty() {
        println!("No sessions in {}", data_dir.display());
        return Ok(());
    }

    println!(
        "{:<24} {:<12} {:>12} {:<25} FILE",
        "SESSION", "STATE", "SIZE", "LAST ACCESSED"
    );
    for (_, stored) in sessions {
        let (size, file) = match &stored.selected_file {
            Some(selected) => (selected.total_size.to_string(), selected.path.as_str()),
            None => ("-".to_string(), "-"),
        };
        println!(
            "{:<24} {:<12} {:>12} {:<25} {}",
            stored.session_id.to_string(),
            stored.state.to_string(),
            size,
            stored.last_accessed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            file
        );
    }
    Ok(())
}
