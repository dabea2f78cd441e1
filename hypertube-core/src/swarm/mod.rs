//! Contract between download sessions and a torrent engine.
//!
//! The peer-wire protocol, DHT and trackers live inside the engine. This
//! module only fixes what a session needs from it: resolve a source to a file
//! list, pick which files to fetch, and receive completed pieces. Engines
//! that report pieces through callbacks on their own threads normalize them
//! into a [`SwarmEvent`] channel here, so the session actor is the only task
//! that touches its piece store.

pub mod feed;
pub mod source;

#[cfg(feature = "rqbit")]
pub mod rqbit;
#[cfg(any(test, feature = "simulation"))]
pub mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "rqbit")]
pub use rqbit::RqbitSwarm;
pub use source::{InfoHash, MagnetLink, TorrentSource, sanitize_link};
#[cfg(any(test, feature = "simulation"))]
pub use simulated::{PieceDelivery, PieceOrder, SimulatedFailure, SimulatedSwarm};

/// One file inside a torrent, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmFile {
    /// Torrent-relative path, `/` separated
    pub path: String,
    /// Length in bytes
    pub size: u64,
}

/// Torrent geometry known once the source is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub name: String,
    pub files: Vec<SwarmFile>,
    pub piece_length: u32,
}

impl TorrentMetadata {
    /// Number of pieces covering file `file_index`, the last one possibly short.
    pub fn piece_count(&self, file_index: usize) -> Option<u32> {
        let file = self.files.get(file_index)?;
        if self.piece_length == 0 {
            return None;
        }
        u32::try_from(file.size.div_ceil(u64::from(self.piece_length))).ok()
    }
}

/// Notification from an engine about the selected file.
///
/// Piece indices are relative to the start of the selected file: piece `i`
/// covers bytes `[i * piece_length, (i + 1) * piece_length)` of that file.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A verified piece is ready; `data` holds its bytes
    PieceReady { piece_index: u32, data: Bytes },
    /// The engine hit an error that ends the download
    Error(SwarmError),
}

/// Torrent engine able to join swarms.
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Joins the swarm behind `source` and waits for its metadata.
    ///
    /// May take minutes while peers are discovered. Returns promptly with
    /// `SwarmError::Cancelled` once `cancel` fires.
    ///
    /// # Errors
    ///
    /// - `SwarmError::MagnetParse` - If the source cannot be understood
    /// - `SwarmError::NoPeers` - If no peer can supply metadata
    /// - `SwarmError::Cancelled` - If `cancel` fired first
    async fn resolve(
        &self,
        source: &TorrentSource,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn SwarmTorrent>, SwarmError>;
}

/// A resolved torrent owned by exactly one download session.
#[async_trait]
pub trait SwarmTorrent: Send {
    fn metadata(&self) -> &TorrentMetadata;

    /// Starts fetching file `file_index`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::InvalidFileIndex` - If the torrent has no such file
    async fn select_file(&mut self, file_index: usize) -> Result<(), SwarmError>;

    /// Stops fetching file `file_index`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::InvalidFileIndex` - If the torrent has no such file
    async fn deselect_file(&mut self, file_index: usize) -> Result<(), SwarmError>;

    /// Hands out the event stream. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<SwarmEvent>>;

    /// Leaves the swarm and stops all transfers.
    async fn shutdown(&mut self);
}

/// Failure modes surfaced by an engine.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("No peers available for torrent")]
    NoPeers,

    #[error("Invalid magnet link: {reason}")]
    MagnetParse { reason: String },

    #[error("Torrent not resolved within {after:?}")]
    Timeout { after: Duration },

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Torrent engine closed")]
    EngineClosed,

    #[error("Torrent engine error: {reason}")]
    Engine { reason: String },

    #[error("Torrent has no file at index {index}")]
    InvalidFileIndex { index: usize },
}
