//! Byte-range streaming over partially downloaded files.
//!
//! Range headers resolve to [`RangeRequest`]s that are served chunk by chunk.
//! Each chunk waits for its bytes on the piece store before reading them, so
//! playback can start as soon as the first chunk is on disk.

pub mod availability;
pub mod range;

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use availability::{AvailabilityReport, AvailabilityReporter};
pub use range::{RangeError, RangeRequest, RangeSpec, unsatisfied_content_range};

use crate::session::{SessionError, SessionId};
use crate::storage::{SessionStorage, StorageError, WaitOutcome};

/// Errors that end a range response.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Range error: {0}")]
    Range(#[from] RangeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The swarm did not deliver the bytes in time
    #[error("Bytes {start}-{end} not available after {after:?}")]
    DataTimeout { start: u64, end: u64, after: Duration },

    /// The session failed or was torn down while a reader waited
    #[error("Session {id} stopped before the bytes arrived")]
    Aborted { id: SessionId },

    #[error("Request cancelled")]
    Cancelled,
}

/// Waits for `chunk` to be on disk, then reads it.
///
/// # Errors
///
/// - `StreamingError::DataTimeout` - If the bytes did not arrive within `timeout`
/// - `StreamingError::Aborted` - If the session stopped while waiting
/// - `StreamingError::Cancelled` - If `cancel` fired first
/// - `StreamingError::Storage` - If the range is out of bounds or the read failed
pub async fn read_chunk(
    storage: &SessionStorage,
    chunk: RangeRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Bytes, StreamingError> {
    match storage
        .await_available(chunk.start, chunk.end, timeout, cancel)
        .await?
    {
        WaitOutcome::Ready => Ok(storage.read(chunk.start, chunk.end).await?),
        WaitOutcome::TimedOut => Err(StreamingError::DataTimeout {
            start: chunk.start,
            end: chunk.end,
            after: timeout,
        }),
        WaitOutcome::Aborted => Err(StreamingError::Aborted {
            id: storage.id().clone(),
        }),
        WaitOutcome::Cancelled => Err(StreamingError::Cancelled),
    }
}
