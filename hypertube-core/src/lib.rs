//! Hypertube Core - torrent-backed byte-range streaming
//!
//! This crate turns a swarm's piece arrivals into a byte-addressable media
//! file that can be served while the download is still running: the piece
//! store and its availability map, the swarm engine contract, per-title
//! download sessions, HTTP range resolution and availability reporting.

pub mod config;
pub mod session;
pub mod storage;
pub mod streaming;
pub mod swarm;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::HypertubeConfig;
pub use session::{
    DownloadManager, FailureReason, Quality, SelectedFile, SessionError, SessionFailure,
    SessionHandle, SessionId, SessionSnapshot, SessionState,
};
pub use storage::{
    ByteRange, PieceAvailabilityMap, PieceStore, SessionStorage, StorageError, WaitOutcome,
};
pub use streaming::{AvailabilityReport, AvailabilityReporter, RangeRequest, StreamingError};
pub use swarm::{SwarmEngine, SwarmError, TorrentSource};

/// Core errors that can bubble up from any Hypertube subsystem.
#[derive(Debug, thiserror::Error)]
pub enum HypertubeError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HypertubeError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            HypertubeError::Session(e) => match e {
                SessionError::UnknownSession { id } => format!("No stream named {id}"),
                SessionError::InvalidTitleId { .. } | SessionError::InvalidQuality { .. } => {
                    e.to_string()
                }
                _ => "Download session error occurred".to_string(),
            },
            HypertubeError::Swarm(e) => match e {
                SwarmError::NoPeers => "No peers available for this torrent".to_string(),
                SwarmError::MagnetParse { reason } => format!("Invalid magnet link: {reason}"),
                SwarmError::Timeout { .. } => "Torrent could not be resolved in time".to_string(),
                _ => "Download error occurred".to_string(),
            },
            HypertubeError::Storage(_) => "Storage error occurred".to_string(),
            HypertubeError::Streaming(_) => "Streaming error occurred".to_string(),
            HypertubeError::Configuration { .. } => "Configuration error occurred".to_string(),
            HypertubeError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            HypertubeError::Configuration { .. }
                | HypertubeError::Swarm(SwarmError::MagnetParse { .. })
                | HypertubeError::Session(
                    SessionError::InvalidTitleId { .. } | SessionError::InvalidQuality { .. }
                )
                | HypertubeError::Streaming(StreamingError::Range(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, HypertubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_classified() {
        let error = HypertubeError::from(SwarmError::MagnetParse {
            reason: "missing xt".to_string(),
        });
        assert!(error.is_user_error());
        assert_eq!(error.user_message(), "Invalid magnet link: missing xt");

        let error = HypertubeError::from(SwarmError::NoPeers);
        assert!(!error.is_user_error());
    }
}
