//! Single-writer task driving one session from resolution to completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::SessionShared;
use super::{
    FailureReason, SelectedFile, SessionFailure, SessionRecord, SessionState, record, video,
};
use crate::storage::{PieceStore, SessionStorage};
use crate::swarm::{SwarmEngine, SwarmError, SwarmEvent, SwarmTorrent, TorrentSource};

/// Dependencies every session actor needs.
#[derive(Clone)]
pub(super) struct ActorContext {
    pub engine: Arc<dyn SwarmEngine>,
    pub store: Arc<PieceStore>,
    pub resolve_timeout: Duration,
}

pub(super) struct SessionActor {
    shared: Arc<SessionShared>,
    context: ActorContext,
    cancel: CancellationToken,
}

impl SessionActor {
    pub(super) fn new(
        shared: Arc<SessionShared>,
        context: ActorContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            context,
            cancel,
        }
    }

    /// Runs until the session completes, fails or is cancelled.
    pub(super) async fn run(self) {
        let id = self.shared.id().clone();
        debug!(session = %id, "Session actor started");

        if self.restore_completed().await {
            return;
        }

        match self.download().await {
            Ok(()) => debug!(session = %id, "Session actor stopped"),
            Err(failure) if self.cancel.is_cancelled() => {
                debug!(session = %id, "Session actor cancelled: {}", failure.message);
            }
            Err(failure) => self.fail(failure).await,
        }
    }

    /// Reattaches a download finished in an earlier run without touching the swarm.
    async fn restore_completed(&self) -> bool {
        let id = self.shared.id();
        let stored = match record::load(self.shared.dir()).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return false,
            Err(e) => {
                warn!(session = %id, "Ignoring session record: {e}");
                return false;
            }
        };

        if stored.state != SessionState::Completed {
            // Keep the original creation time across retries and restarts
            self.shared
                .update_record(|record| record.created_at = stored.created_at);
            return false;
        }

        let (Some(file), Some(path)) = (
            stored.selected_file.clone(),
            stored.media_path(self.shared.dir()),
        ) else {
            return false;
        };

        match self
            .context
            .store
            .register_completed(id, &path, file.total_size)
            .await
        {
            Ok(storage) => {
                self.shared.attach_storage(storage);
                self.transition(SessionState::Completed, |record| {
                    record.failure = None;
                    record.selected_file = Some(file);
                    record.piece_length = stored.piece_length;
                    record.piece_count = stored.piece_count;
                    record.created_at = stored.created_at;
                    record.completed_at = stored.completed_at;
                })
                .await;
                info!(session = %id, path = %path.display(), "Restored completed download");
                true
            }
            Err(e) => {
                warn!(session = %id, "Completed download is not usable, downloading again: {e}");
                false
            }
        }
    }

    async fn download(&self) -> Result<(), SessionFailure> {
        let id = self.shared.id().clone();
        let record = self
            .transition(SessionState::Resolving, |record| record.failure = None)
            .await;

        let source = TorrentSource::parse(&record.source)?;
        info!(session = %id, %source, "Resolving torrent");
        let mut torrent = self.resolve(&source).await?;

        let result = self.drive(&mut torrent).await;
        torrent.shutdown().await;
        result
    }

    async fn resolve(&self, source: &TorrentSource) -> Result<Box<dyn SwarmTorrent>, SwarmError> {
        let timeout = self.context.resolve_timeout;
        match tokio::time::timeout(timeout, self.context.engine.resolve(source, &self.cancel)).await
        {
            Ok(result) => result,
            Err(_) => Err(SwarmError::Timeout { after: timeout }),
        }
    }

    async fn drive(&self, torrent: &mut Box<dyn SwarmTorrent>) -> Result<(), SessionFailure> {
        let id = self.shared.id().clone();
        let metadata = torrent.metadata().clone();

        let index = video::select_playable_file(&metadata.files).ok_or_else(|| {
            SessionFailure::new(
                FailureReason::NoPlayableFile,
                format!("no playable video among {} files", metadata.files.len()),
            )
        })?;
        let file = &metadata.files[index];
        let piece_count = metadata.piece_count(index).ok_or_else(|| {
            SessionFailure::new(FailureReason::EngineClosed, "engine reported no piece geometry")
        })?;

        for other in 0..metadata.files.len() {
            torrent.deselect_file(other).await?;
        }
        torrent.select_file(index).await?;

        let path = super::layout::media_path(self.shared.dir(), &file.path).ok_or_else(|| {
            SessionFailure::new(FailureReason::NoPlayableFile, "selected file has no safe path")
        })?;
        let storage = self.context.store.register(&id, &path, file.size).await?;
        self.shared.attach_storage(Arc::clone(&storage));

        let selected = SelectedFile {
            index,
            path: file.path.clone(),
            total_size: file.size,
        };
        self.transition(SessionState::Downloading, |record| {
            record.selected_file = Some(selected);
            record.piece_length = Some(metadata.piece_length);
            record.piece_count = Some(piece_count);
        })
        .await;
        info!(
            session = %id,
            file = %file.path,
            size = file.size,
            piece_length = metadata.piece_length,
            piece_count,
            "Downloading"
        );

        if storage.is_complete() {
            return self.complete(&storage).await;
        }

        let mut events = torrent
            .take_events()
            .ok_or_else(|| SessionFailure::from(SwarmError::EngineClosed))?;
        let piece_length = u64::from(metadata.piece_length);

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };

            match event {
                None => return Err(SwarmError::EngineClosed.into()),
                Some(SwarmEvent::Error(e)) => return Err(e.into()),
                Some(SwarmEvent::PieceReady { piece_index, data }) => {
                    if piece_index >= piece_count {
                        warn!(session = %id, piece_index, piece_count, "Ignoring piece outside selected file");
                        continue;
                    }
                    let offset = u64::from(piece_index) * piece_length;
                    let expected = piece_length.min(file.size - offset);
                    if data.len() as u64 != expected {
                        warn!(
                            session = %id,
                            piece_index,
                            len = data.len(),
                            expected,
                            "Ignoring piece with unexpected length"
                        );
                        continue;
                    }

                    if storage.write(offset, data).await? {
                        debug!(session = %id, piece_index, "Piece stored");
                    }
                    if storage.is_complete() {
                        return self.complete(&storage).await;
                    }
                }
            }
        }
    }

    async fn complete(&self, storage: &SessionStorage) -> Result<(), SessionFailure> {
        self.transition(SessionState::Completed, |record| {
            record.completed_at = Some(Utc::now());
        })
        .await;
        info!(
            session = %self.shared.id(),
            size = storage.total_size(),
            "Download completed"
        );
        Ok(())
    }

    async fn fail(&self, failure: SessionFailure) {
        let id = self.shared.id();
        error!(session = %id, reason = ?failure.reason, "Session failed: {}", failure.message);

        // Abort before publishing `Failed`: a retry reuses this storage
        if let Some(storage) = self.shared.storage() {
            storage.abort_waiters();
        }
        self.transition(SessionState::Failed, |record| record.failure = Some(failure))
            .await;
    }

    /// Updates the record, persists it, then publishes `state` to watchers.
    ///
    /// Watchers that see a new state can rely on the record being on disk.
    async fn transition(
        &self,
        state: SessionState,
        update: impl FnOnce(&mut SessionRecord),
    ) -> SessionRecord {
        let record = self.shared.update_record(|record| {
            record.state = state;
            update(record);
        });
        self.shared.persist().await;
        self.shared.publish(state);
        record
    }
}
