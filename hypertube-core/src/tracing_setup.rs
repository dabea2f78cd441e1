//! Log output for the Hypertube binaries
//!
//! The console shows what the operator asked for. The run log keeps every
//! event at TRACE, per-piece writes and per-chunk waits included, and is
//! replaced on each start.

use std::fmt;
use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt as layer_fmt};

/// File name of the run log inside the logs directory.
pub const RUN_LOG: &str = "hypertube-last-run.log";

/// Dependencies kept at WARN on the console unless the operator asks for DEBUG.
const NOISY_TARGETS: &[&str] = &["librqbit", "hyper", "h2"];

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot create run log {path}: {source}")]
    RunLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracing already initialized: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Console filter directives for `level`.
///
/// Engine and HTTP internals only reach the console at DEBUG and TRACE.
pub fn console_directives(level: Level) -> String {
    let mut directives = level.to_string().to_lowercase();
    if level < Level::DEBUG {
        for target in NOISY_TARGETS {
            directives.push_str(&format!(",{target}=warn"));
        }
    }
    directives
}

/// Installs the console layer and the run log layer.
///
/// `RUST_LOG` replaces the console directives when set. Returns the path of
/// the run log (under `logs_dir`, or `./logs`).
///
/// # Errors
///
/// - `TracingError::RunLog` - If the logs directory or the run log cannot be created
/// - `TracingError::AlreadyInitialized` - If a global subscriber is already set
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingError> {
    let logs_dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    let run_log = logs_dir.join(RUN_LOG);
    let file = create_dir_all(logs_dir)
        .and_then(|()| File::create(&run_log))
        .map_err(|source| TracingError::RunLog {
            path: run_log.clone(),
            source,
        })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));
    let console = layer_fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let run_log_layer = layer_fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console)
        .with(run_log_layer)
        .try_init()?;

    tracing::info!(console = %console_level, run_log = %run_log.display(), "Tracing initialized");
    Ok(run_log)
}

/// `--log-level` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Session lifecycle, plus warnings and errors
    Info,
    /// Range requests and engine internals
    Debug,
    /// All messages including per-piece tracing
    Trace,
}

impl CliLogLevel {
    /// # Examples
    /// ```
    /// use hypertube_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Info.as_tracing_level(), tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}
