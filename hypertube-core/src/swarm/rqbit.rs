//! Swarm engine backed by librqbit.
//!
//! `resolve` asks the session for the torrent metadata only (list-only add),
//! so no payload is fetched before a file is chosen. Selecting a file adds the
//! torrent for real with that file alone and starts a feeder task that reads
//! the file through librqbit's streaming reader. The reader blocks until the
//! engine has verified the underlying pieces, and the feeder cuts what it reads
//! into `piece_length` slices of the selected file, so sessions see the same
//! [`SwarmEvent`] stream as with any other engine.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Api, Session, SessionOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::feed::feed_pieces;
use super::{
    SwarmEngine, SwarmError, SwarmEvent, SwarmFile, SwarmTorrent, TorrentMetadata, TorrentSource,
};

const EVENT_CAPACITY: usize = 64;

/// librqbit session shared by every torrent of the process.
pub struct RqbitSwarm {
    session: Arc<Session>,
    api: Api,
    download_dir: PathBuf,
}

impl RqbitSwarm {
    /// Starts a librqbit session keeping its own files under `download_dir`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - If `download_dir` cannot be created
    /// - `SwarmError::Engine` - If the session cannot start (port or DHT setup)
    pub async fn new(download_dir: PathBuf) -> Result<Self, SwarmError> {
        tokio::fs::create_dir_all(&download_dir).await?;

        let opts = SessionOptions {
            disable_dht: false,
            disable_dht_persistence: true,
            enable_upnp_port_forwarding: false,
            ..Default::default()
        };
        let session = Session::new_with_opts(download_dir.clone(), opts)
            .await
            .map_err(engine_error)?;
        let api = Api::new(Arc::clone(&session), None);

        info!(download_dir = %download_dir.display(), "librqbit session started");
        Ok(Self {
            session,
            api,
            download_dir,
        })
    }
}

fn engine_error(e: impl std::fmt::Display) -> SwarmError {
    SwarmError::Engine {
        reason: e.to_string(),
    }
}

#[async_trait]
impl SwarmEngine for RqbitSwarm {
    async fn resolve(
        &self,
        source: &TorrentSource,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn SwarmTorrent>, SwarmError> {
        debug!(%source, "Fetching torrent metadata");
        let opts = AddTorrentOptions {
            list_only: true,
            ..Default::default()
        };
        let added = tokio::select! {
            _ = cancel.cancelled() => return Err(SwarmError::Cancelled),
            added = self.session.add_torrent(AddTorrent::from_url(source.as_str()), Some(opts)) => added,
        };

        let listed = match added.map_err(engine_error)? {
            AddTorrentResponse::ListOnly(listed) => listed,
            AddTorrentResponse::Added(_, handle) | AddTorrentResponse::AlreadyManaged(_, handle) => {
                return Err(engine_error(format!(
                    "torrent {} is already running in the engine",
                    handle.info_hash().as_string()
                )));
            }
        };

        let mut files = Vec::new();
        for details in listed.info.iter_file_details().map_err(engine_error)? {
            files.push(SwarmFile {
                path: details.filename.to_string().map_err(engine_error)?,
                size: details.len,
            });
        }
        if files.is_empty() {
            return Err(SwarmError::NoPeers);
        }

        let info_hash = listed.info_hash.as_string();
        let name = match source {
            TorrentSource::Magnet(magnet) => magnet
                .display_name
                .clone()
                .unwrap_or_else(|| info_hash.clone()),
            TorrentSource::TorrentUrl(url) => url.to_string(),
        };
        let metadata = TorrentMetadata {
            name,
            files,
            piece_length: listed.info.piece_length,
        };
        info!(
            %source,
            files = metadata.files.len(),
            piece_length = metadata.piece_length,
            "Torrent metadata received"
        );

        let (sender, events) = mpsc::channel(EVENT_CAPACITY);
        Ok(Box::new(RqbitTorrent {
            session: Arc::clone(&self.session),
            api: self.api.clone(),
            link: source.as_str().to_string(),
            output_folder: self.download_dir.join(&info_hash),
            metadata,
            sender,
            events: Some(events),
            selected: None,
            torrent_id: None,
            feeder: CancellationToken::new(),
        }))
    }
}

struct RqbitTorrent {
    session: Arc<Session>,
    api: Api,
    link: String,
    output_folder: PathBuf,
    metadata: TorrentMetadata,
    sender: mpsc::Sender<SwarmEvent>,
    events: Option<mpsc::Receiver<SwarmEvent>>,
    selected: Option<usize>,
    torrent_id: Option<usize>,
    feeder: CancellationToken,
}

impl RqbitTorrent {
    async fn add_for_download(&self, file_index: usize) -> Result<usize, SwarmError> {
        let opts = AddTorrentOptions {
            overwrite: true,
            only_files: Some(vec![file_index]),
            output_folder: Some(self.output_folder.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let added = self
            .session
            .add_torrent(AddTorrent::from_url(self.link.as_str()), Some(opts))
            .await
            .map_err(engine_error)?;

        match added {
            AddTorrentResponse::Added(id, _) => Ok(id),
            AddTorrentResponse::AlreadyManaged(id, handle) => {
                let only: HashSet<usize> = std::iter::once(file_index).collect();
                handle.update_only_files(&only).await.map_err(engine_error)?;
                Ok(id)
            }
            AddTorrentResponse::ListOnly(_) => {
                Err(engine_error("torrent was added in list-only mode"))
            }
        }
    }

    fn spawn_feeder(&self, torrent_id: usize, file_index: usize) -> Result<(), SwarmError> {
        let size = self
            .metadata
            .files
            .get(file_index)
            .map(|file| file.size)
            .ok_or(SwarmError::InvalidFileIndex { index: file_index })?;
        let reader = self
            .api
            .api_stream(TorrentIdOrHash::Id(torrent_id), file_index)
            .map_err(engine_error)?;

        tokio::spawn(feed_pieces(
            reader,
            size,
            self.metadata.piece_length,
            self.sender.clone(),
            self.feeder.clone(),
        ));
        Ok(())
    }
}

#[async_trait]
impl SwarmTorrent for RqbitTorrent {
    fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    async fn select_file(&mut self, file_index: usize) -> Result<(), SwarmError> {
        if file_index >= self.metadata.files.len() {
            return Err(SwarmError::InvalidFileIndex { index: file_index });
        }
        if self.selected == Some(file_index) {
            return Ok(());
        }

        let torrent_id = self.add_for_download(file_index).await?;
        self.feeder.cancel();
        self.feeder = CancellationToken::new();
        self.spawn_feeder(torrent_id, file_index)?;
        self.selected = Some(file_index);
        self.torrent_id = Some(torrent_id);
        info!(torrent_id, file_index, "Downloading selected file");
        Ok(())
    }

    async fn deselect_file(&mut self, file_index: usize) -> Result<(), SwarmError> {
        if file_index >= self.metadata.files.len() {
            return Err(SwarmError::InvalidFileIndex { index: file_index });
        }
        // Only the selected file is ever part of the download
        if self.selected == Some(file_index) {
            self.feeder.cancel();
            self.selected = None;
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<SwarmEvent>> {
        self.events.take()
    }

    async fn shutdown(&mut self) {
        self.feeder.cancel();
        if let Some(torrent_id) = self.torrent_id.take() {
            if let Err(e) = self
                .session
                .delete(TorrentIdOrHash::Id(torrent_id), false)
                .await
            {
                warn!(torrent_id, "Failed to remove torrent from engine: {e}");
            }
        }
    }
}

impl Drop for RqbitTorrent {
    fn drop(&mut self) {
        self.feeder.cancel();
    }
}
