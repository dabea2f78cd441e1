//! Centralized configuration for Hypertube.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Central configuration for all Hypertube components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct HypertubeConfig {
    pub storage: StorageConfig,
    pub swarm: SwarmConfig,
    pub streaming: StreamingConfig,
    pub server: ServerConfig,
    pub simulation: SimulationConfig,
}

/// On-disk layout and retention of downloaded sessions.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory; each session lives in `<data_dir>/<title_id>/<quality>`
    pub data_dir: PathBuf,
    /// Idle time after which an inactive session directory is removed (None = keep forever)
    pub retention: Option<Duration>,
    /// How often the retention sweep runs when `retention` is set
    pub eviction_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("downloads"),
            retention: None,
            eviction_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Swarm join behavior.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Upper bound on resolving a magnet link to a file list
    pub resolve_timeout: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(120),
        }
    }
}

/// HTTP range streaming parameters.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// How long a range request waits for missing bytes before giving up
    pub await_timeout: Duration,
    /// Size of each body chunk read from the piece store
    pub chunk_size: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            await_timeout: Duration::from_secs(30),
            chunk_size: 65536, // 64 KiB
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    /// Returns the `host:port` string the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Simulated swarm used in development mode and tests.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Seed for piece arrival order (None = sequential delivery)
    pub seed: Option<u64>,
    /// Piece length reported by the simulated torrent
    pub piece_length: u32,
    /// Size of the simulated video file
    pub video_size: u64,
    /// Delay between two simulated piece arrivals
    pub piece_interval: Duration,
    /// Delay before a magnet link resolves
    pub resolve_delay: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            piece_length: 262_144,          // 256 KiB
            video_size: 64 * 1024 * 1024,   // 64 MiB
            piece_interval: Duration::from_millis(20),
            resolve_delay: Duration::from_millis(500),
        }
    }
}

impl HypertubeConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("HYPERTUBE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }

        if let Some(days) = env_u64("HYPERTUBE_RETENTION_DAYS") {
            match retention_from_days(days) {
                Some(retention) => config.storage.retention = Some(retention),
                None => warn!(days, "Ignoring HYPERTUBE_RETENTION_DAYS: value too large"),
            }
        }

        if let Some(seconds) = env_u64("HYPERTUBE_RESOLVE_TIMEOUT") {
            config.swarm.resolve_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_u64("HYPERTUBE_AWAIT_TIMEOUT") {
            config.streaming.await_timeout = Duration::from_secs(seconds);
        }

        if let Some(bytes) = env_u64("HYPERTUBE_CHUNK_SIZE").filter(|bytes| *bytes > 0) {
            config.streaming.chunk_size = bytes;
        }

        if let Ok(bind) = std::env::var("HYPERTUBE_BIND") {
            if let Some((host, port)) = bind.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    config.server.host = host.to_string();
                    config.server.port = port;
                }
            }
        }

        if let Some(seed) = env_u64("HYPERTUBE_SIMULATION_SEED") {
            config.simulation.seed = Some(seed);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing(data_dir: PathBuf) -> Self {
        Self {
            storage: StorageConfig {
                data_dir,
                ..Default::default()
            },
            swarm: SwarmConfig {
                resolve_timeout: Duration::from_secs(2),
            },
            streaming: StreamingConfig {
                await_timeout: Duration::from_secs(2),
                chunk_size: 256,
            },
            server: ServerConfig::default(),
            simulation: SimulationConfig {
                seed: Some(42),
                piece_length: 100,
                video_size: 1000,
                piece_interval: Duration::from_millis(1),
                resolve_delay: Duration::from_millis(10),
            },
        }
    }
}

/// Retention period of `days` whole days, `None` if it does not fit in seconds.
pub fn retention_from_days(days: u64) -> Option<Duration> {
    days.checked_mul(SECONDS_PER_DAY).map(Duration::from_secs)
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse::<u64>().ok()
}
