//! In-process swarm for development mode and tests.
//!
//! Resolves any valid source to a configurable file list and delivers pieces
//! of deterministic content, either on a timer or on demand. Failure modes
//! cover the paths a real engine takes when a swarm is dead or a disk fills.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    SwarmEngine, SwarmError, SwarmEvent, SwarmFile, SwarmTorrent, TorrentMetadata, TorrentSource,
};
use crate::config::SimulationConfig;

/// Order in which pieces of the selected file arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOrder {
    Sequential,
    /// Seeded permutation, reproducible across runs
    Shuffled { seed: u64 },
}

/// How pieces reach the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceDelivery {
    /// A background task sends one piece every `interval`
    Automatic { interval: Duration },
    /// Nothing arrives until [`SimulatedSwarm::deliver_piece`] is called
    Manual,
}

/// Failure to inject into every torrent this swarm resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedFailure {
    None,
    /// `resolve` fails with `SwarmError::NoPeers`
    NoPeers,
    /// `resolve` never finishes until cancelled
    Stall,
    /// An I/O error is reported after `pieces` pieces were delivered
    IoAfter { pieces: u32 },
}

/// Byte stored at `offset` of simulated file `file_index`.
pub fn simulated_byte(file_index: usize, offset: u64) -> u8 {
    ((offset.wrapping_mul(31) + file_index as u64 * 7) % 251) as u8
}

/// Content of `len` bytes of simulated file `file_index` starting at `offset`.
pub fn simulated_content(file_index: usize, offset: u64, len: u64) -> Vec<u8> {
    (offset..offset + len)
        .map(|pos| simulated_byte(file_index, pos))
        .collect()
}

/// Simulated torrent engine.
pub struct SimulatedSwarm {
    files: Vec<SwarmFile>,
    piece_length: u32,
    resolve_delay: Duration,
    order: PieceOrder,
    delivery: PieceDelivery,
    failure: SimulatedFailure,
    resolve_calls: AtomicUsize,
    torrents: Mutex<HashMap<String, Arc<TorrentControl>>>,
}

struct TorrentControl {
    sender: mpsc::Sender<SwarmEvent>,
    selected: Mutex<Option<usize>>,
}

impl SimulatedSwarm {
    /// One small non-video file followed by a video file of `video_size` bytes.
    pub fn new(video_size: u64, piece_length: u32) -> Self {
        Self {
            files: vec![
                SwarmFile {
                    path: "Sample.Movie.2024/Sample.Movie.2024.nfo".to_string(),
                    size: 512,
                },
                SwarmFile {
                    path: "Sample.Movie.2024/Sample.Movie.2024.1080p.mp4".to_string(),
                    size: video_size,
                },
            ],
            piece_length,
            resolve_delay: Duration::ZERO,
            order: PieceOrder::Sequential,
            delivery: PieceDelivery::Manual,
            failure: SimulatedFailure::None,
            resolve_calls: AtomicUsize::new(0),
            torrents: Mutex::new(HashMap::new()),
        }
    }

    /// Development-mode engine configured from `config`.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let order = match config.seed {
            Some(seed) => PieceOrder::Shuffled { seed },
            None => PieceOrder::Sequential,
        };
        Self::new(config.video_size, config.piece_length)
            .with_resolve_delay(config.resolve_delay)
            .with_order(order)
            .with_delivery(PieceDelivery::Automatic {
                interval: config.piece_interval,
            })
    }

    pub fn with_files(mut self, files: Vec<SwarmFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = delay;
        self
    }

    pub fn with_order(mut self, order: PieceOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_delivery(mut self, delivery: PieceDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_failure(mut self, failure: SimulatedFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Number of `resolve` calls so far, successful or not.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn files(&self) -> &[SwarmFile] {
        &self.files
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Delivers piece `piece_index` of the selected file of the torrent
    /// resolved from `link`. Returns `false` if no such torrent or piece exists.
    pub async fn deliver_piece(&self, link: &str, piece_index: u32) -> bool {
        let Some(control) = self.control(link) else {
            return false;
        };
        let Some(file_index) = *control.selected.lock() else {
            return false;
        };
        let Some(data) = piece_bytes(&self.files, self.piece_length, file_index, piece_index)
        else {
            return false;
        };
        control
            .sender
            .send(SwarmEvent::PieceReady { piece_index, data })
            .await
            .is_ok()
    }

    /// Reports `error` on the torrent resolved from `link`.
    pub async fn inject_error(&self, link: &str, error: SwarmError) -> bool {
        match self.control(link) {
            Some(control) => control.sender.send(SwarmEvent::Error(error)).await.is_ok(),
            None => false,
        }
    }

    fn control(&self, link: &str) -> Option<Arc<TorrentControl>> {
        let source = TorrentSource::parse(link).ok()?;
        self.torrents.lock().get(source.as_str()).cloned()
    }
}

fn piece_bytes(
    files: &[SwarmFile],
    piece_length: u32,
    file_index: usize,
    piece_index: u32,
) -> Option<Bytes> {
    let size = files.get(file_index)?.size;
    let offset = u64::from(piece_index) * u64::from(piece_length);
    if offset >= size {
        return None;
    }
    let len = u64::from(piece_length).min(size - offset);
    Some(Bytes::from(simulated_content(file_index, offset, len)))
}

#[async_trait]
impl SwarmEngine for SimulatedSwarm {
    async fn resolve(
        &self,
        source: &TorrentSource,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn SwarmTorrent>, SwarmError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        debug!(%source, "Simulated resolve started");

        let delay = match self.failure {
            SimulatedFailure::Stall => Duration::MAX,
            _ => self.resolve_delay,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(SwarmError::Cancelled),
            _ = sleep_for(delay) => {}
        }
        if self.failure == SimulatedFailure::NoPeers {
            return Err(SwarmError::NoPeers);
        }

        let (sender, events) = mpsc::channel(64);
        let control = Arc::new(TorrentControl {
            sender,
            selected: Mutex::new(None),
        });
        self.torrents
            .lock()
            .insert(source.as_str().to_string(), Arc::clone(&control));

        let name = match source {
            TorrentSource::Magnet(magnet) => magnet
                .display_name
                .clone()
                .unwrap_or_else(|| magnet.info_hash.to_string()),
            TorrentSource::TorrentUrl(url) => url.to_string(),
        };

        Ok(Box::new(SimulatedTorrent {
            metadata: TorrentMetadata {
                name,
                files: self.files.clone(),
                piece_length: self.piece_length,
            },
            control,
            events: Some(events),
            order: self.order,
            delivery: self.delivery,
            failure: self.failure,
            feeder: CancellationToken::new(),
        }))
    }
}

async fn sleep_for(delay: Duration) {
    if delay == Duration::MAX {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

struct SimulatedTorrent {
    metadata: TorrentMetadata,
    control: Arc<TorrentControl>,
    events: Option<mpsc::Receiver<SwarmEvent>>,
    order: PieceOrder,
    delivery: PieceDelivery,
    failure: SimulatedFailure,
    feeder: CancellationToken,
}

impl SimulatedTorrent {
    fn spawn_feeder(&self, file_index: usize, interval: Duration) {
        let Some(piece_count) = self.metadata.piece_count(file_index) else {
            return;
        };
        let mut pieces: Vec<u32> = (0..piece_count).collect();
        if let PieceOrder::Shuffled { seed } = self.order {
            pieces.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        }

        let files = self.metadata.files.clone();
        let piece_length = self.metadata.piece_length;
        let sender = self.control.sender.clone();
        let cancel = self.feeder.clone();
        let fail_after = match self.failure {
            SimulatedFailure::IoAfter { pieces } => Some(pieces),
            _ => None,
        };

        tokio::spawn(async move {
            for (delivered, piece_index) in pieces.into_iter().enumerate() {
                if fail_after.is_some_and(|limit| delivered as u32 >= limit) {
                    let error = std::io::Error::other("simulated disk failure");
                    let _ = sender.send(SwarmEvent::Error(SwarmError::Io(error))).await;
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(data) = piece_bytes(&files, piece_length, file_index, piece_index) else {
                    continue;
                };
                trace!(file_index, piece_index, "Simulated piece delivered");
                if sender
                    .send(SwarmEvent::PieceReady { piece_index, data })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl SwarmTorrent for SimulatedTorrent {
    fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    async fn select_file(&mut self, file_index: usize) -> Result<(), SwarmError> {
        if file_index >= self.metadata.files.len() {
            return Err(SwarmError::InvalidFileIndex { index: file_index });
        }
        *self.control.selected.lock() = Some(file_index);
        if let PieceDelivery::Automatic { interval } = self.delivery {
            self.spawn_feeder(file_index, interval);
        }
        Ok(())
    }

    async fn deselect_file(&mut self, file_index: usize) -> Result<(), SwarmError> {
        if file_index >= self.metadata.files.len() {
            return Err(SwarmError::InvalidFileIndex { index: file_index });
        }
        let mut selected = self.control.selected.lock();
        if *selected == Some(file_index) {
            *selected = None;
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<SwarmEvent>> {
        self.events.take()
    }

    async fn shutdown(&mut self) {
        self.feeder.cancel();
    }
}

impl Drop for SimulatedTorrent {
    fn drop(&mut self) {
        self.feeder.cancel();
    }
}
