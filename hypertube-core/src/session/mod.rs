//! Download sessions keyed by (title, quality).
//!
//! A session resolves its torrent, picks the playable file, feeds arriving
//! pieces into the piece store and persists a small record so a finished
//! download survives restarts. [`DownloadManager`] deduplicates concurrent
//! starts so each (title, quality) pair joins the swarm at most once.

mod actor;
mod handle;
pub mod layout;
mod manager;
pub mod record;
pub mod video;

#[cfg(test)]
mod tests;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use handle::SessionHandle;
pub use manager::DownloadManager;
pub use record::SessionRecord;

use crate::storage::StorageError;
use crate::swarm::SwarmError;

/// Vertical resolutions the metadata service labels torrents with.
pub const KNOWN_QUALITIES: [u16; 12] = [
    144, 240, 360, 480, 576, 720, 900, 1080, 1440, 1600, 2160, 4320,
];

/// Video quality such as `1080p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Quality(u16);

impl Quality {
    /// # Errors
    ///
    /// - `SessionError::InvalidQuality` - If `height` is not a known resolution
    pub fn from_height(height: u16) -> Result<Self, SessionError> {
        if KNOWN_QUALITIES.contains(&height) {
            Ok(Self(height))
        } else {
            Err(SessionError::InvalidQuality {
                quality: height.to_string(),
            })
        }
    }

    pub fn height(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p", self.0)
    }
}

impl FromStr for Quality {
    type Err = SessionError;

    /// Accepts `1080p`, `1080P` or `1080`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_suffix('p')
            .or_else(|| s.strip_suffix('P'))
            .unwrap_or(s);
        let height = digits
            .parse::<u16>()
            .map_err(|_| SessionError::InvalidQuality {
                quality: s.to_string(),
            })?;
        Self::from_height(height).map_err(|_| SessionError::InvalidQuality {
            quality: s.to_string(),
        })
    }
}

impl Serialize for Quality {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Composite key of a session, rendered as `"{title_id}-{quality}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    title_id: String,
    quality: Quality,
}

impl SessionId {
    /// Title ids are used as directory names, so only ASCII letters, digits
    /// and `_` are accepted.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidTitleId` - If `title_id` is empty or has other characters
    pub fn new(title_id: &str, quality: Quality) -> Result<Self, SessionError> {
        let valid = !title_id.is_empty()
            && title_id.len() <= 64
            && title_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SessionError::InvalidTitleId {
                title_id: title_id.to_string(),
            });
        }
        Ok(Self {
            title_id: title_id.to_string(),
            quality,
        })
    }

    pub fn title_id(&self) -> &str {
        &self.title_id
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.title_id, self.quality)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (title_id, quality) = s
            .rsplit_once('-')
            .ok_or_else(|| SessionError::InvalidSessionId { id: s.to_string() })?;
        let quality = quality
            .parse()
            .map_err(|_| SessionError::InvalidSessionId { id: s.to_string() })?;
        Self::new(title_id, quality).map_err(|_| SessionError::InvalidSessionId { id: s.to_string() })
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Resolving,
    Downloading,
    Completed,
    Failed,
}

impl SessionState {
    /// True while an actor owns the session and no retry is needed.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Failed)
    }

    pub fn has_storage(self) -> bool {
        matches!(self, Self::Downloading | Self::Completed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a session ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoPlayableFile,
    NoPeers,
    MagnetParse,
    Timeout,
    Io,
    EngineClosed,
}

/// Failure recorded on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl SessionFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<SwarmError> for SessionFailure {
    fn from(error: SwarmError) -> Self {
        let reason = match &error {
            SwarmError::NoPeers => FailureReason::NoPeers,
            SwarmError::MagnetParse { .. } => FailureReason::MagnetParse,
            SwarmError::Timeout { .. } => FailureReason::Timeout,
            SwarmError::Io(_) => FailureReason::Io,
            SwarmError::Cancelled
            | SwarmError::EngineClosed
            | SwarmError::Engine { .. }
            | SwarmError::InvalidFileIndex { .. } => FailureReason::EngineClosed,
        };
        Self::new(reason, error.to_string())
    }
}

impl From<StorageError> for SessionFailure {
    fn from(error: StorageError) -> Self {
        Self::new(FailureReason::Io, error.to_string())
    }
}

/// The media file chosen from a torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedFile {
    pub index: usize,
    /// Torrent-relative path
    pub path: String,
    pub total_size: u64,
}

/// Point-in-time view of a session, as served by the status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub title_id: String,
    pub quality: Quality,
    pub state: SessionState,
    pub failure: Option<SessionFailure>,
    pub selected_file: Option<SelectedFile>,
    pub piece_length: Option<u32>,
    pub piece_count: Option<u32>,
    pub covered_bytes: u64,
    pub progress_percent: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid title id '{title_id}'")]
    InvalidTitleId { title_id: String },

    #[error("Invalid quality '{quality}'")]
    InvalidQuality { quality: String },

    #[error("Invalid session id '{id}'")]
    InvalidSessionId { id: String },

    #[error("Unknown session {id}")]
    UnknownSession { id: SessionId },

    /// The torrent did not resolve within the caller's patience
    #[error("Session {id} is still resolving")]
    NotReady { id: SessionId },

    #[error("Session {id} failed: {}", failure.message)]
    Failed {
        id: SessionId,
        failure: SessionFailure,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Download manager is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
