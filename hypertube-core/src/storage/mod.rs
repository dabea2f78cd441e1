//! Storage layer for streamed media files.
//!
//! Each session owns one pre-allocated backing file plus an availability map
//! of the byte intervals already written. Swarm pieces are written at their
//! file offsets in any order; HTTP readers ask the map before touching disk.

pub mod availability;
mod file_io;
pub mod piece_store;

pub use availability::{ByteRange, PieceAvailabilityMap};
pub use piece_store::{PieceStore, SessionStorage, WaitOutcome};

use crate::session::SessionId;

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No backing file is registered for the session
    #[error("No storage registered for session {id}")]
    UnknownSession {
        /// Session that was looked up
        id: SessionId,
    },

    /// A write or wait targets bytes past the end of the file
    #[error("Range {start}..{end} exceeds file size {total_size}")]
    OutOfBounds {
        /// First byte of the offending range
        start: u64,
        /// End of the offending range (exclusive)
        end: u64,
        /// Size of the backing file
        total_size: u64,
    },

    /// `read` was called for bytes that are not fully on disk
    #[error("Bytes {start}-{end} are not available yet")]
    RangeNotAvailable {
        /// First requested byte
        start: u64,
        /// Last requested byte (inclusive)
        end: u64,
    },

    /// An existing media file does not match the recorded size
    #[error("File {path} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Path of the media file
        path: String,
        /// Size recorded for the session
        expected: u64,
        /// Size found on disk
        actual: u64,
    },

    /// The session sidecar record could not be decoded
    #[error("Corrupt session record {path}: {reason}")]
    CorruptRecord {
        /// Path of the sidecar file
        path: String,
        /// Decoder message
        reason: String,
    },

    /// A blocking disk task panicked or was cancelled
    #[error("Disk task failed: {reason}")]
    DiskTask {
        /// Join error description
        reason: String,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(error: tokio::task::JoinError) -> Self {
        StorageError::DiskTask {
            reason: error.to_string(),
        }
    }
}
