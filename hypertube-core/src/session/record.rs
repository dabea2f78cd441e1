//! Sidecar record persisted next to each session's media file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::{SelectedFile, SessionFailure, SessionId, SessionState, layout};
use crate::storage::StorageError;

/// Persisted state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SessionFailure>,
    pub selected_file: Option<SelectedFile>,
    pub piece_length: Option<u32>,
    pub piece_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    /// Link the torrent was resolved from
    pub source: String,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, source: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            state: SessionState::NotStarted,
            failure: None,
            selected_file: None,
            piece_length: None,
            piece_count: None,
            created_at: now,
            completed_at: None,
            last_accessed_at: now,
            source,
        }
    }

    /// Media file location if a file was selected.
    pub fn media_path(&self, session_dir: &Path) -> Option<PathBuf> {
        let file = self.selected_file.as_ref()?;
        layout::media_path(session_dir, &file.path)
    }
}

/// Reads the record in `session_dir`, `None` if there is none.
///
/// # Errors
///
/// - `StorageError::CorruptRecord` - If the record cannot be decoded
/// - `StorageError::Io` - If the record cannot be read
pub async fn load(session_dir: &Path) -> Result<Option<SessionRecord>, StorageError> {
    let path = layout::record_path(session_dir);
    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| StorageError::CorruptRecord {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Writes the record atomically: a temporary file renamed over the old one.
///
/// # Errors
///
/// - `StorageError::Io` - If the directory, temporary file or rename fails
pub async fn save(session_dir: &Path, record: &SessionRecord) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(session_dir).await?;
    let path = layout::record_path(session_dir);
    let tmp = path.with_extension("json.tmp");
    let contents = serde_json::to_vec_pretty(record).map_err(|e| StorageError::CorruptRecord {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, &path).await?;
    trace!(session = %record.session_id, state = %record.state, "Session record saved");
    Ok(())
}

/// Collects every readable record below `data_dir`, sorted by session id.
///
/// Unreadable records are logged and skipped.
///
/// # Errors
///
/// - `StorageError::Io` - If `data_dir` exists but cannot be listed
pub async fn list(data_dir: &Path) -> Result<Vec<(PathBuf, SessionRecord)>, StorageError> {
    let mut records = Vec::new();
    let mut titles = match tokio::fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };

    while let Some(title) = titles.next_entry().await? {
        // Title ids never start with a dot; engines keep their own files there
        if !title.file_type().await?.is_dir() || title.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let mut qualities = tokio::fs::read_dir(title.path()).await?;
        while let Some(quality) = qualities.next_entry().await? {
            let dir = quality.path();
            match load(&dir).await {
                Ok(Some(record)) => records.push((dir, record)),
                Ok(None) => {}
                Err(e) => warn!(dir = %dir.display(), "Skipping session record: {e}"),
            }
        }
    }

    records.sort_by(|a, b| a.1.session_id.cmp(&b.1.session_id));
    Ok(records)
}
