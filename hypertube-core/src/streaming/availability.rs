//! Read-only availability view for seek bars and playback decisions.

use std::sync::Arc;

use serde::Serialize;

use crate::session::SessionId;
use crate::storage::{ByteRange, PieceStore, StorageError};

/// Availability of one session's file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReport {
    pub session_id: SessionId,
    /// `None` until the torrent is resolved
    pub total_size: Option<u64>,
    pub covered_bytes: u64,
    /// Ascending, disjoint, half-open intervals
    pub ranges: Vec<ByteRange>,
    pub progress_percent: f64,
}

impl AvailabilityReport {
    /// Report for a session whose file is not known yet.
    pub fn unresolved(session_id: SessionId) -> Self {
        Self {
            session_id,
            total_size: None,
            covered_bytes: 0,
            ranges: Vec::new(),
            progress_percent: 0.0,
        }
    }
}

/// Answers which bytes of a session can be read without waiting.
#[derive(Clone)]
pub struct AvailabilityReporter {
    store: Arc<PieceStore>,
}

impl AvailabilityReporter {
    pub fn new(store: Arc<PieceStore>) -> Self {
        Self { store }
    }

    /// Available intervals at or after `start_offset`, ascending.
    ///
    /// An interval straddling `start_offset` is clipped to begin there.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If the session has no storage yet
    pub fn contiguous_ranges_from(
        &self,
        id: &SessionId,
        start_offset: u64,
    ) -> Result<Vec<ByteRange>, StorageError> {
        Ok(self.store.storage(id)?.snapshot().ranges_from(start_offset))
    }

    /// Percentage of the file on disk. Never decreases for a session.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If the session has no storage yet
    pub fn progress_percent(&self, id: &SessionId) -> Result<f64, StorageError> {
        Ok(self.store.storage(id)?.snapshot().progress_percent())
    }

    /// Full report taken from a single consistent snapshot.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If the session has no storage yet
    pub fn report(
        &self,
        id: &SessionId,
        start_offset: u64,
    ) -> Result<AvailabilityReport, StorageError> {
        let map = self.store.storage(id)?.snapshot();
        Ok(AvailabilityReport {
            session_id: id.clone(),
            total_size: Some(map.total_size()),
            covered_bytes: map.covered_bytes(),
            ranges: map.ranges_from(start_offset),
            progress_percent: map.progress_percent(),
        })
    }
}
