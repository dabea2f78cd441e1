//! Registry of download sessions with start deduplication.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actor::{ActorContext, SessionActor};
use super::handle::SessionShared;
use super::{
    Quality, SessionError, SessionHandle, SessionId, SessionRecord, SessionSnapshot,
    SessionState, layout, record,
};
use crate::config::HypertubeConfig;
use crate::storage::PieceStore;
use crate::swarm::{SwarmEngine, sanitize_link};

struct SessionEntry {
    handle: SessionHandle,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Owns every download session of the process.
///
/// The session map is only a lookup table. Each session's progress lives in
/// its own handle and storage, so a stalled swarm never blocks other sessions.
pub struct DownloadManager {
    context: ActorContext,
    config: HypertubeConfig,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(engine: Arc<dyn SwarmEngine>, config: HypertubeConfig) -> Self {
        Self {
            context: ActorContext {
                engine,
                store: Arc::new(PieceStore::new()),
                resolve_timeout: config.swarm.resolve_timeout,
            },
            config,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HypertubeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.context.store
    }

    /// Starts or attaches to the session for (`title_id`, `quality`).
    ///
    /// Returns immediately. A live session is returned as is, without contacting
    /// the swarm; a failed one is restarted with `link`. New sessions first
    /// look for a completed download on disk before resolving `link`.
    /// Link problems surface as a failed session, not as an error here.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidTitleId` - If `title_id` is not a safe identifier
    /// - `SessionError::ShuttingDown` - If [`Self::shutdown`] was called
    pub fn start(
        &self,
        title_id: &str,
        quality: Quality,
        link: &str,
    ) -> Result<SessionHandle, SessionError> {
        let id = SessionId::new(title_id, quality)?;
        if self.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        let link = sanitize_link(link);

        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(&id) {
            let shared = Arc::clone(entry.handle.shared());
            shared.touch();
            let state = entry.handle.state();
            if state.is_live() {
                debug!(session = %id, %state, "Attached to existing session");
                // Before the actor's first transition the record on disk is still being read
                if state != SessionState::NotStarted {
                    tokio::spawn(async move { shared.persist().await });
                }
                return Ok(entry.handle.clone());
            }

            info!(session = %id, "Retrying failed session");
            shared.update_record(|record| record.source = link);
            let (cancel, task) = self.spawn_actor(shared);
            entry.cancel = cancel;
            entry.task = Some(task);
            return Ok(entry.handle.clone());
        }

        let dir = layout::session_dir(&self.config.storage.data_dir, &id);
        let shared = Arc::new(SessionShared::new(dir, SessionRecord::new(id.clone(), link)));
        let handle = SessionHandle::new(Arc::clone(&shared));
        let (cancel, task) = self.spawn_actor(shared);
        sessions.insert(
            id.clone(),
            SessionEntry {
                handle: handle.clone(),
                cancel,
                task: Some(task),
            },
        );
        info!(session = %id, "Session created");
        Ok(handle)
    }

    fn spawn_actor(&self, shared: Arc<SessionShared>) -> (CancellationToken, JoinHandle<()>) {
        let cancel = self.shutdown.child_token();
        let actor = SessionActor::new(shared, self.context.clone(), cancel.clone());
        (cancel, tokio::spawn(actor.run()))
    }

    /// Handle of a known session.
    ///
    /// # Errors
    ///
    /// - `SessionError::UnknownSession` - If the session was never started
    pub fn handle(&self, id: &SessionId) -> Result<SessionHandle, SessionError> {
        self.sessions
            .lock()
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| SessionError::UnknownSession { id: id.clone() })
    }

    /// Non-blocking snapshot of a session.
    ///
    /// # Errors
    ///
    /// - `SessionError::UnknownSession` - If the session was never started
    pub fn status(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        self.handle(id).map(|handle| handle.snapshot())
    }

    /// Snapshots of every session, ordered by id.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        let mut snapshots: Vec<SessionSnapshot> =
            handles.iter().map(SessionHandle::snapshot).collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Removes downloads not accessed for `max_idle`.
    ///
    /// Sessions still resolving or downloading are kept. Returns the ids of
    /// the removed sessions.
    ///
    /// # Errors
    ///
    /// - `SessionError::Storage` - If the data directory cannot be listed
    pub async fn evict_stale(&self, max_idle: Duration) -> Result<Vec<SessionId>, SessionError> {
        let cutoff = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle));
        let Some(cutoff) = cutoff else {
            return Ok(Vec::new());
        };
        let mut evicted = Vec::new();

        for (dir, stored) in record::list(&self.config.storage.data_dir).await? {
            let id = stored.session_id.clone();
            let last_accessed_at = {
                let mut sessions = self.sessions.lock();
                let last_accessed_at = match sessions.get(&id) {
                    None => stored.last_accessed_at,
                    Some(entry) => {
                        if !matches!(
                            entry.handle.state(),
                            SessionState::Completed | SessionState::Failed
                        ) {
                            continue;
                        }
                        entry.handle.shared().record().last_accessed_at
                    }
                };
                if last_accessed_at >= cutoff {
                    continue;
                }
                if let Some(entry) = sessions.remove(&id) {
                    entry.cancel.cancel();
                }
                last_accessed_at
            };

            self.context.store.release(&id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    info!(session = %id, %last_accessed_at, "Evicted idle download");
                    if let Some(title_dir) = dir.parent() {
                        // Only succeeds once the last quality of a title is gone
                        let _ = tokio::fs::remove_dir(title_dir).await;
                    }
                    evicted.push(id);
                }
                Err(e) => warn!(session = %id, "Failed to evict download: {e}"),
            }
        }

        Ok(evicted)
    }

    /// Stops every session actor and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .sessions
            .lock()
            .values_mut()
            .filter_map(|entry| entry.task.take())
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Session actor panicked: {e}");
            }
        }
        info!("Download manager stopped");
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
