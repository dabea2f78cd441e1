//! Per-session backing files with availability tracking and range waits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::availability::PieceAvailabilityMap;
use super::{StorageError, file_io};
use crate::session::SessionId;

/// Result of waiting for a byte range to land on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every requested byte is available
    Ready,
    /// The timeout elapsed first
    TimedOut,
    /// The caller's cancellation token fired
    Cancelled,
    /// The owning session failed while the caller was waiting
    Aborted,
}

/// Wake-up signal shared by all waiters of one session.
#[derive(Debug, Clone, Copy, Default)]
struct StorageSignal {
    covered_bytes: u64,
    aborts: u64,
}

/// Backing file and availability map of a single session.
///
/// The map sits behind its own lock, held only to decide or record
/// availability and never across disk I/O. Pieces occupy disjoint offsets,
/// so writes and reads go to the shared file handle concurrently.
pub struct SessionStorage {
    id: SessionId,
    path: PathBuf,
    total_size: u64,
    file: Arc<std::fs::File>,
    availability: RwLock<PieceAvailabilityMap>,
    signal: watch::Sender<StorageSignal>,
    waiters: AtomicUsize,
}

impl SessionStorage {
    fn new(id: SessionId, path: PathBuf, file: std::fs::File, map: PieceAvailabilityMap) -> Self {
        let (signal, _) = watch::channel(StorageSignal {
            covered_bytes: map.covered_bytes(),
            aborts: 0,
        });
        Self {
            id,
            path,
            total_size: map.total_size(),
            file: Arc::new(file),
            availability: RwLock::new(map),
            signal,
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Writes `data` at `offset` and marks the bytes available.
    ///
    /// Returns `false` when every byte was already present; such duplicate
    /// deliveries skip the disk entirely.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfBounds` - If the write extends past the file
    /// - `StorageError::Io` - If the positional write failed
    pub async fn write(&self, offset: u64, data: Bytes) -> Result<bool, StorageError> {
        let len = data.len() as u64;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.total_size)
            .ok_or(StorageError::OutOfBounds {
                start: offset,
                end: offset.saturating_add(len),
                total_size: self.total_size,
            })?;
        if len == 0 || self.availability.read().covers(offset..end) {
            trace!(session = %self.id, offset, len, "Duplicate write ignored");
            return Ok(false);
        }

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file_io::write_all_at(&file, &data, offset)).await??;

        let covered_bytes = {
            let mut map = self.availability.write();
            map.insert(offset..end);
            map.covered_bytes()
        };
        self.signal
            .send_modify(|signal| signal.covered_bytes = covered_bytes);
        trace!(session = %self.id, offset, len, covered_bytes, "Bytes written");
        Ok(true)
    }

    /// True iff `[start, end]` (inclusive) is covered by one available interval.
    pub fn is_available(&self, start: u64, end: u64) -> bool {
        if start > end || end >= self.total_size {
            return false;
        }
        self.availability.read().covers(start..end + 1)
    }

    /// Reads `[start, end]` (inclusive) from disk.
    ///
    /// Callers check availability first; asking for missing bytes is a bug
    /// in the caller, not a transient condition.
    ///
    /// # Errors
    ///
    /// - `StorageError::RangeNotAvailable` - If any requested byte is missing
    /// - `StorageError::Io` - If the positional read failed
    pub async fn read(&self, start: u64, end: u64) -> Result<Bytes, StorageError> {
        if !self.is_available(start, end) {
            error!(
                session = %self.id,
                start, end, "Read requested for bytes that are not available"
            );
            return Err(StorageError::RangeNotAvailable { start, end });
        }

        let file = Arc::clone(&self.file);
        let len = (end - start + 1) as usize;
        let buf = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            file_io::read_exact_at(&file, &mut buf, start).map(|_| buf)
        })
        .await??;
        Ok(Bytes::from(buf))
    }

    /// Suspends the calling task until `[start, end]` is available.
    ///
    /// Only this session's writers wake the waiter. The waiter is deregistered
    /// on every exit path, including the future being dropped.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfBounds` - If the range can never become available
    pub async fn await_available(
        &self,
        start: u64,
        end: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, StorageError> {
        if start > end || end >= self.total_size {
            return Err(StorageError::OutOfBounds {
                start,
                end: end.saturating_add(1),
                total_size: self.total_size,
            });
        }

        let _registration = WaiterRegistration::new(&self.waiters);
        let mut receiver = self.signal.subscribe();
        let aborts_at_entry = receiver.borrow_and_update().aborts;
        if self.is_available(start, end) {
            return Ok(WaitOutcome::Ready);
        }

        debug!(session = %self.id, start, end, ?timeout, "Waiting for bytes");
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                _ = &mut deadline => return Ok(WaitOutcome::TimedOut),
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Ok(WaitOutcome::Aborted);
                    }
                    let signal = *receiver.borrow_and_update();
                    if self.is_available(start, end) {
                        return Ok(WaitOutcome::Ready);
                    }
                    if signal.aborts != aborts_at_entry {
                        return Ok(WaitOutcome::Aborted);
                    }
                }
            }
        }
    }

    /// Wakes every pending waiter with `WaitOutcome::Aborted`.
    pub fn abort_waiters(&self) {
        self.signal.send_modify(|signal| signal.aborts += 1);
    }

    /// Number of tasks currently suspended in `await_available`.
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Consistent copy of the availability map.
    pub fn snapshot(&self) -> PieceAvailabilityMap {
        self.availability.read().clone()
    }

    pub fn covered_bytes(&self) -> u64 {
        self.availability.read().covered_bytes()
    }

    pub fn is_complete(&self) -> bool {
        self.availability.read().is_complete()
    }
}

struct WaiterRegistration<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> WaiterRegistration<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for WaiterRegistration<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of session storages keyed by session id.
///
/// The registry is only a lookup table; all per-byte state lives in the
/// individual [`SessionStorage`] so sessions never contend with each other.
#[derive(Default)]
pub struct PieceStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionStorage>>>,
}

impl PieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens or creates the pre-allocated backing file for a download.
    ///
    /// Re-registering the same path and size (a retry after failure) keeps
    /// the existing storage so bytes already present stay available.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file cannot be created or resized
    pub async fn register(
        &self,
        id: &SessionId,
        path: &Path,
        total_size: u64,
    ) -> Result<Arc<SessionStorage>, StorageError> {
        if let Some(existing) = self.sessions.read().get(id) {
            if existing.path == path && existing.total_size == total_size {
                return Ok(Arc::clone(existing));
            }
        }

        let owned_path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            file_io::open_preallocated(&owned_path, total_size)
        })
        .await??;

        let storage = Arc::new(SessionStorage::new(
            id.clone(),
            path.to_path_buf(),
            file,
            PieceAvailabilityMap::new(total_size),
        ));
        debug!(session = %id, path = %path.display(), total_size, "Storage registered");
        self.insert(storage)
    }

    /// Registers a file that is already fully downloaded.
    ///
    /// # Errors
    ///
    /// - `StorageError::SizeMismatch` - If the file on disk has another size
    /// - `StorageError::Io` - If the file cannot be opened
    pub async fn register_completed(
        &self,
        id: &SessionId,
        path: &Path,
        total_size: u64,
    ) -> Result<Arc<SessionStorage>, StorageError> {
        let owned_path = path.to_path_buf();
        let (file, actual) =
            tokio::task::spawn_blocking(move || file_io::open_existing(&owned_path)).await??;
        if actual != total_size {
            return Err(StorageError::SizeMismatch {
                path: path.display().to_string(),
                expected: total_size,
                actual,
            });
        }

        let storage = Arc::new(SessionStorage::new(
            id.clone(),
            path.to_path_buf(),
            file,
            PieceAvailabilityMap::complete(total_size),
        ));
        self.insert(storage)
    }

    fn insert(&self, storage: Arc<SessionStorage>) -> Result<Arc<SessionStorage>, StorageError> {
        let previous = self
            .sessions
            .write()
            .insert(storage.id.clone(), Arc::clone(&storage));
        if let Some(previous) = previous {
            previous.abort_waiters();
        }
        Ok(storage)
    }

    /// Looks up the storage of a session.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If nothing is registered for `id`
    pub fn storage(&self, id: &SessionId) -> Result<Arc<SessionStorage>, StorageError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownSession { id: id.clone() })
    }

    /// Drops the registry entry; open handles stay valid until released.
    pub fn release(&self, id: &SessionId) -> Option<Arc<SessionStorage>> {
        let storage = self.sessions.write().remove(id);
        if let Some(storage) = &storage {
            storage.abort_waiters();
        }
        storage
    }

    /// Writes `data` at `offset` in the session's backing file.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If nothing is registered for `id`
    /// - `StorageError::OutOfBounds` - If the write extends past the file
    /// - `StorageError::Io` - If the positional write failed
    pub async fn write(
        &self,
        id: &SessionId,
        offset: u64,
        data: Bytes,
    ) -> Result<bool, StorageError> {
        self.storage(id)?.write(offset, data).await
    }

    /// True iff `[start, end]` (inclusive) is fully available.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If nothing is registered for `id`
    pub fn is_available(&self, id: &SessionId, start: u64, end: u64) -> Result<bool, StorageError> {
        Ok(self.storage(id)?.is_available(start, end))
    }

    /// Reads `[start, end]` (inclusive) from the session's backing file.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If nothing is registered for `id`
    /// - `StorageError::RangeNotAvailable` - If any requested byte is missing
    /// - `StorageError::Io` - If the positional read failed
    pub async fn read(&self, id: &SessionId, start: u64, end: u64) -> Result<Bytes, StorageError> {
        self.storage(id)?.read(start, end).await
    }

    /// Waits until `[start, end]` is available, the timeout elapses or
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownSession` - If nothing is registered for `id`
    /// - `StorageError::OutOfBounds` - If the range can never become available
    pub async fn await_available(
        &self,
        id: &SessionId,
        start: u64,
        end: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, StorageError> {
        let storage = self.storage(id)?;
        storage.await_available(start, end, timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::session::Quality;

    fn test_id() -> SessionId {
        SessionId::new("tt0111161", Quality::from_height(1080).unwrap()).unwrap()
    }

    async fn setup(total_size: u64) -> (TempDir, PieceStore, Arc<SessionStorage>) {
        let dir = TempDir::new().unwrap();
        let store = PieceStore::new();
        let storage = store
            .register(&test_id(), &dir.path().join("movie.mp4"), total_size)
            .await
            .unwrap();
        (dir, store, storage)
    }

    #[tokio::test]
    async fn test_register_preallocates_file() {
        let (dir, _store, storage) = setup(1000).await;
        let len = std::fs::metadata(dir.path().join("movie.mp4")).unwrap().len();
        assert_eq!(len, 1000);
        assert_eq!(storage.covered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (_dir, store, _storage) = setup(1000).await;
        let id = test_id();

        store
            .write(&id, 100, Bytes::from(vec![7u8; 50]))
            .await
            .unwrap();
        assert!(store.is_available(&id, 100, 149).unwrap());
        assert!(!store.is_available(&id, 100, 150).unwrap());

        let bytes = store.read(&id, 110, 119).await.unwrap();
        assert_eq!(bytes.as_ref(), &[7u8; 10]);
    }

    #[tokio::test]
    async fn test_read_outside_available_range_fails() {
        let (_dir, store, _storage) = setup(1000).await;
        let id = test_id();
        store.write(&id, 0, Bytes::from(vec![1u8; 10])).await.unwrap();

        let result = store.read(&id, 5, 20).await;
        assert!(matches!(
            result,
            Err(StorageError::RangeNotAvailable { start: 5, end: 20 })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_write_is_idempotent() {
        let (_dir, _store, storage) = setup(100).await;
        assert!(storage.write(0, Bytes::from(vec![1u8; 50])).await.unwrap());
        assert!(!storage.write(10, Bytes::from(vec![9u8; 20])).await.unwrap());
        assert_eq!(storage.covered_bytes(), 50);
        // The skipped duplicate did not touch disk
        assert_eq!(storage.read(10, 10).await.unwrap().as_ref(), &[1u8]);
    }

    #[tokio::test]
    async fn test_write_past_end_is_rejected() {
        let (_dir, _store, storage) = setup(100).await;
        let result = storage.write(90, Bytes::from(vec![0u8; 20])).await;
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));
        assert_eq!(storage.covered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_await_returns_after_covering_write() {
        let (_dir, _store, storage) = setup(1000).await;
        storage.write(0, Bytes::from(vec![1u8; 51])).await.unwrap();
        assert!(!storage.is_available(0, 99));

        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .await_available(0, 99, Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };

        // A write that still leaves byte 99 missing does not release the waiter
        storage.write(51, Bytes::from(vec![2u8; 40])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        storage.write(91, Bytes::from(vec![3u8; 9])).await.unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
        assert!(storage.is_available(0, 99));
    }

    #[tokio::test]
    async fn test_await_times_out() {
        let (_dir, _store, storage) = setup(1000).await;
        let outcome = storage
            .await_available(0, 10, Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(storage.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_deregistered() {
        let (_dir, _store, storage) = setup(1000).await;
        let cancel = CancellationToken::new();

        let waiter = {
            let storage = Arc::clone(&storage);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                storage
                    .await_available(0, 10, Duration::from_secs(30), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(storage.waiter_count(), 1);

        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap(), WaitOutcome::Cancelled);
        assert_eq!(storage.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_wait_future_is_deregistered() {
        let (_dir, _store, storage) = setup(1000).await;
        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .await_available(0, 10, Duration::from_secs(30), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(storage.waiter_count(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(storage.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_wakes_waiters() {
        let (_dir, _store, storage) = setup(1000).await;
        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .await_available(0, 10, Duration::from_secs(30), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        storage.abort_waiters();
        assert_eq!(waiter.await.unwrap().unwrap(), WaitOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_out_of_order_concurrent_writes() {
        let (_dir, _store, storage) = setup(1000).await;
        let mut tasks = Vec::new();
        for piece in (0..10u64).rev() {
            let storage = Arc::clone(&storage);
            tasks.push(tokio::spawn(async move {
                storage
                    .write(piece * 100, Bytes::from(vec![piece as u8; 100]))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(storage.is_complete());
        assert_eq!(storage.snapshot().ranges().len(), 1);
        assert_eq!(storage.read(500, 500).await.unwrap().as_ref(), &[5u8]);
    }

    #[tokio::test]
    async fn test_register_completed_checks_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let store = PieceStore::new();

        let result = store.register_completed(&test_id(), &path, 100).await;
        assert!(matches!(result, Err(StorageError::SizeMismatch { .. })));

        let storage = store.register_completed(&test_id(), &path, 64).await.unwrap();
        assert!(storage.is_complete());
        assert!(storage.is_available(0, 63));
    }

    #[tokio::test]
    async fn test_unknown_session_is_reported() {
        let store = PieceStore::new();
        let result = store.is_available(&test_id(), 0, 1);
        assert!(matches!(result, Err(StorageError::UnknownSession { .. })));
    }
}
