//! Cloneable view of one download session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{SessionError, SessionId, SessionRecord, SessionSnapshot, SessionState, record};
use crate::storage::SessionStorage;

/// State shared between a session's actor and its handles.
///
/// Only the actor (and the manager while no actor runs) writes here.
pub(super) struct SessionShared {
    id: SessionId,
    dir: PathBuf,
    record: RwLock<SessionRecord>,
    storage: RwLock<Option<Arc<SessionStorage>>>,
    state: watch::Sender<SessionState>,
    /// Serializes record saves so the newest record is the last one written
    save_lock: Mutex<()>,
}

impl SessionShared {
    pub(super) fn new(dir: PathBuf, record: SessionRecord) -> Self {
        let (state, _) = watch::channel(record.state);
        Self {
            id: record.session_id.clone(),
            dir,
            record: RwLock::new(record),
            storage: RwLock::new(None),
            state,
            save_lock: Mutex::new(()),
        }
    }

    pub(super) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(super) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(super) fn record(&self) -> SessionRecord {
        self.record.read().clone()
    }

    /// Applies `update` to the record and returns the result.
    pub(super) fn update_record(&self, update: impl FnOnce(&mut SessionRecord)) -> SessionRecord {
        let mut record = self.record.write();
        update(&mut record);
        record.clone()
    }

    /// Writes the current record to the session directory.
    pub(super) async fn persist(&self) {
        let _guard = self.save_lock.lock().await;
        let current = self.record();
        if let Err(e) = record::save(&self.dir, &current).await {
            warn!(session = %self.id, "Failed to persist session record: {e}");
        }
    }

    /// Wakes state watchers. Callers update and persist the record first.
    pub(super) fn publish(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    pub(super) fn attach_storage(&self, storage: Arc<SessionStorage>) {
        *self.storage.write() = Some(storage);
    }

    pub(super) fn storage(&self) -> Option<Arc<SessionStorage>> {
        self.storage.read().clone()
    }

    pub(super) fn touch(&self) {
        self.record.write().last_accessed_at = Utc::now();
    }
}

/// Handle to a download session returned by [`super::DownloadManager::start`].
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(super) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub(super) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn id(&self) -> &SessionId {
        self.shared.id()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Directory holding the media file and record.
    pub fn dir(&self) -> &Path {
        self.shared.dir()
    }

    /// Backing storage once a file has been selected.
    pub fn storage(&self) -> Option<Arc<SessionStorage>> {
        self.shared.storage()
    }

    /// Non-blocking snapshot of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let record = self.shared.record();
        let (covered_bytes, progress_percent) = match self.shared.storage() {
            Some(storage) => {
                let map = storage.snapshot();
                (map.covered_bytes(), map.progress_percent())
            }
            None => (0, 0.0),
        };

        SessionSnapshot {
            title_id: record.session_id.title_id().to_string(),
            quality: record.session_id.quality(),
            session_id: record.session_id,
            state: record.state,
            failure: record.failure,
            selected_file: record.selected_file,
            piece_length: record.piece_length,
            piece_count: record.piece_count,
            covered_bytes,
            progress_percent,
            created_at: record.created_at,
            completed_at: record.completed_at,
            last_accessed_at: record.last_accessed_at,
        }
    }

    /// Waits until the session reaches a state matching `predicate`.
    ///
    /// Returns the matching state, or `None` on timeout.
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(SessionState) -> bool,
        timeout: Duration,
    ) -> Option<SessionState> {
        let mut receiver = self.shared.state.subscribe();
        let result = tokio::time::timeout(timeout, receiver.wait_for(|state| predicate(*state)))
            .await
            .ok()?;
        result.ok().map(|state| *state)
    }

    /// Waits until the session has backing storage to read from.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotReady` - If the torrent did not resolve within `timeout`
    /// - `SessionError::Failed` - If the session failed
    /// - `SessionError::Cancelled` - If `cancel` fired first
    pub async fn await_storage(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<SessionStorage>, SessionError> {
        let mut receiver = self.shared.state.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let state = *receiver.borrow_and_update();
            if state.has_storage() {
                if let Some(storage) = self.shared.storage() {
                    return Ok(storage);
                }
            }
            if state == SessionState::Failed {
                let failure = self.shared.record().failure;
                return Err(SessionError::Failed {
                    id: self.id().clone(),
                    failure: failure.unwrap_or_else(|| {
                        super::SessionFailure::new(super::FailureReason::EngineClosed, "unknown")
                    }),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = &mut deadline => return Err(SessionError::NotReady { id: self.id().clone() }),
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::ShuttingDown);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", self.id())
            .field("state", &self.state())
            .finish()
    }
}
