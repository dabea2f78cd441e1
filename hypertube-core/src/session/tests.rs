use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::HypertubeConfig;
use crate::storage::WaitOutcome;
use crate::swarm::simulated::simulated_content;
use crate::swarm::{
    PieceDelivery, SimulatedFailure, SimulatedSwarm, SwarmEngine, SwarmError, SwarmFile,
};

const LINK: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
const TITLE: &str = "tt0111161";
const WAIT: Duration = Duration::from_secs(5);

fn hd() -> Quality {
    Quality::from_height(1080).unwrap()
}

fn manager_with(swarm: &Arc<SimulatedSwarm>, config: HypertubeConfig) -> DownloadManager {
    DownloadManager::new(Arc::clone(swarm) as Arc<dyn SwarmEngine>, config)
}

fn manager(dir: &Path, swarm: &Arc<SimulatedSwarm>) -> DownloadManager {
    manager_with(swarm, HypertubeConfig::for_testing(dir.to_path_buf()))
}

fn is(state: SessionState) -> impl Fn(SessionState) -> bool {
    move |current| current == state
}

async fn download_all(swarm: &SimulatedSwarm, handle: &SessionHandle) {
    assert_eq!(
        handle.wait_for_state(is(SessionState::Downloading), WAIT).await,
        Some(SessionState::Downloading)
    );
    for piece in (0..10).rev() {
        assert!(swarm.deliver_piece(LINK, piece).await);
    }
    assert_eq!(
        handle.wait_for_state(is(SessionState::Completed), WAIT).await,
        Some(SessionState::Completed)
    );
}

#[tokio::test]
async fn test_concurrent_starts_join_swarm_once() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100).with_resolve_delay(Duration::from_millis(20)));
    let manager = Arc::new(manager(dir.path(), &swarm));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            manager.start(TITLE, hd(), LINK).unwrap().id().clone()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().to_string(), "tt0111161-1080p");
    }

    let id = SessionId::new(TITLE, hd()).unwrap();
    let handle = manager.handle(&id).unwrap();
    handle
        .wait_for_state(is(SessionState::Downloading), WAIT)
        .await
        .unwrap();
    assert_eq!(swarm.resolve_calls(), 1);
    assert_eq!(manager.sessions().len(), 1);
}

#[tokio::test]
async fn test_all_pieces_complete_the_session() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);

    let handle = manager.start(TITLE, hd(), LINK).unwrap();
    download_all(&swarm, &handle).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, SessionState::Completed);
    assert!(snapshot.completed_at.is_some());
    assert_eq!(snapshot.covered_bytes, 1000);
    assert_eq!(snapshot.progress_percent, 100.0);
    assert_eq!(snapshot.piece_length, Some(100));
    assert_eq!(snapshot.piece_count, Some(10));
    let selected = snapshot.selected_file.unwrap();
    assert_eq!(selected.index, 1);
    assert_eq!(selected.total_size, 1000);

    let media = handle.dir().join(&selected.path);
    assert_eq!(std::fs::read(media).unwrap(), simulated_content(1, 0, 1000));

    // Attaching again never touches the swarm
    let again = manager.start(TITLE, hd(), LINK).unwrap();
    assert_eq!(again.state(), SessionState::Completed);
    assert_eq!(swarm.resolve_calls(), 1);
}

#[tokio::test]
async fn test_completed_session_survives_restart() {
    let dir = TempDir::new().unwrap();
    let first_swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let first = manager(dir.path(), &first_swarm);
    let handle = first.start(TITLE, hd(), LINK).unwrap();
    download_all(&first_swarm, &handle).await;
    let completed_at = handle.snapshot().completed_at;
    first.shutdown().await;

    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);
    let handle = manager.start(TITLE, hd(), LINK).unwrap();
    assert_eq!(
        handle.wait_for_state(is(SessionState::Completed), WAIT).await,
        Some(SessionState::Completed)
    );
    assert_eq!(swarm.resolve_calls(), 0);
    assert_eq!(handle.snapshot().completed_at, completed_at);

    let storage = handle.storage().unwrap();
    assert!(storage.is_available(0, 999));
    assert_eq!(
        storage.read(500, 509).await.unwrap().as_ref(),
        simulated_content(1, 500, 10).as_slice()
    );
}

#[tokio::test]
async fn test_truncated_media_file_is_downloaded_again() {
    let dir = TempDir::new().unwrap();
    let first_swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let first = manager(dir.path(), &first_swarm);
    let handle = first.start(TITLE, hd(), LINK).unwrap();
    download_all(&first_swarm, &handle).await;
    let media = handle
        .dir()
        .join(handle.snapshot().selected_file.unwrap().path);
    first.shutdown().await;
    std::fs::OpenOptions::new()
        .write(true)
        .open(&media)
        .unwrap()
        .set_len(10)
        .unwrap();

    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);
    let handle = manager.start(TITLE, hd(), LINK).unwrap();
    assert_eq!(
        handle.wait_for_state(is(SessionState::Downloading), WAIT).await,
        Some(SessionState::Downloading)
    );
    assert_eq!(swarm.resolve_calls(), 1);
}

#[tokio::test]
async fn test_bad_magnet_fails_and_retry_recovers() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);

    let handle = manager
        .start(TITLE, hd(), "magnet:?xt=urn:btih:1234")
        .unwrap();
    assert_eq!(
        handle.wait_for_state(is(SessionState::Failed), WAIT).await,
        Some(SessionState::Failed)
    );
    let failure = handle.snapshot().failure.unwrap();
    assert_eq!(failure.reason, FailureReason::MagnetParse);
    assert_eq!(swarm.resolve_calls(), 0);

    let retried = manager.start(TITLE, hd(), LINK).unwrap();
    assert_eq!(retried.id(), handle.id());
    assert_eq!(
        retried.wait_for_state(is(SessionState::Downloading), WAIT).await,
        Some(SessionState::Downloading)
    );
    assert!(retried.snapshot().failure.is_none());
    assert_eq!(swarm.resolve_calls(), 1);
}

#[tokio::test]
async fn test_resolve_failures_are_recorded() {
    let cases = [
        (SimulatedFailure::NoPeers, FailureReason::NoPeers),
        (SimulatedFailure::Stall, FailureReason::Timeout),
    ];
    for (failure, reason) in cases {
        let dir = TempDir::new().unwrap();
        let swarm = Arc::new(SimulatedSwarm::new(1000, 100).with_failure(failure));
        let mut config = HypertubeConfig::for_testing(dir.path().to_path_buf());
        config.swarm.resolve_timeout = Duration::from_millis(50);
        let manager = manager_with(&swarm, config);

        let handle = manager.start(TITLE, hd(), LINK).unwrap();
        assert_eq!(
            handle.wait_for_state(is(SessionState::Failed), WAIT).await,
            Some(SessionState::Failed)
        );
        assert_eq!(handle.snapshot().failure.unwrap().reason, reason);

        // The failure is persisted for inspection
        let stored = record::load(handle.dir()).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Failed);
    }
}

#[tokio::test]
async fn test_torrent_without_video_fails() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100).with_files(vec![
        SwarmFile {
            path: "Album/track01.flac".to_string(),
            size: 4000,
        },
        SwarmFile {
            path: "Album/cover.jpg".to_string(),
            size: 300,
        },
    ]));
    let manager = manager(dir.path(), &swarm);

    let handle = manager.start(TITLE, hd(), LINK).unwrap();
    assert_eq!(
        handle.wait_for_state(is(SessionState::Failed), WAIT).await,
        Some(SessionState::Failed)
    );
    assert_eq!(
        handle.snapshot().failure.unwrap().reason,
        FailureReason::NoPlayableFile
    );
}

#[tokio::test]
async fn test_engine_error_aborts_waiters() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);
    let handle = manager.start(TITLE, hd(), LINK).unwrap();

    let storage = handle
        .await_storage(WAIT, &CancellationToken::new())
        .await
        .unwrap();
    let waiter = {
        let storage = Arc::clone(&storage);
        tokio::spawn(async move {
            storage
                .await_available(0, 999, WAIT, &CancellationToken::new())
                .await
        })
    };
    while storage.waiter_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let error = SwarmError::Io(std::io::Error::other("disk full"));
    assert!(swarm.inject_error(LINK, error).await);

    assert_eq!(waiter.await.unwrap().unwrap(), WaitOutcome::Aborted);
    assert_eq!(
        handle.wait_for_state(is(SessionState::Failed), WAIT).await,
        Some(SessionState::Failed)
    );
    assert_eq!(handle.snapshot().failure.unwrap().reason, FailureReason::Io);

    let result = handle.await_storage(WAIT, &CancellationToken::new()).await;
    assert!(matches!(result, Err(SessionError::Failed { .. })));
}

#[tokio::test]
async fn test_io_failure_keeps_pieces_already_written() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(
        SimulatedSwarm::new(1000, 100)
            .with_delivery(PieceDelivery::Automatic {
                interval: Duration::from_millis(1),
            })
            .with_failure(SimulatedFailure::IoAfter { pieces: 3 }),
    );
    let manager = manager(dir.path(), &swarm);

    let handle = manager.start(TITLE, hd(), LINK).unwrap();
    assert_eq!(
        handle.wait_for_state(is(SessionState::Failed), WAIT).await,
        Some(SessionState::Failed)
    );
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.failure.unwrap().reason, FailureReason::Io);
    assert_eq!(snapshot.covered_bytes, 300);
}

#[tokio::test]
async fn test_await_storage_times_out_while_resolving() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100).with_failure(SimulatedFailure::Stall));
    let manager = manager(dir.path(), &swarm);
    let handle = manager.start(TITLE, hd(), LINK).unwrap();

    let result = handle
        .await_storage(Duration::from_millis(20), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(SessionError::NotReady { .. })));
    assert_eq!(handle.state(), SessionState::Resolving);
}

#[tokio::test]
async fn test_evict_stale_removes_idle_downloads() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);

    let done = manager.start(TITLE, hd(), LINK).unwrap();
    download_all(&swarm, &done).await;

    let active_link = "magnet:?xt=urn:btih:89abcdef0123456789abcdef0123456789abcdef";
    let active = manager.start("tt0068646", hd(), active_link).unwrap();
    active
        .wait_for_state(is(SessionState::Downloading), WAIT)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let evicted = manager.evict_stale(Duration::ZERO).await.unwrap();
    assert_eq!(evicted, vec![done.id().clone()]);
    assert!(!done.dir().exists());
    assert!(manager.handle(done.id()).is_err());
    assert!(active.dir().exists());

    // A recent access keeps a download
    let evicted = manager
        .evict_stale(Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(evicted.is_empty());
}

#[tokio::test]
async fn test_invalid_title_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);

    let result = manager.start("../../etc", hd(), LINK);
    assert!(matches!(result, Err(SessionError::InvalidTitleId { .. })));
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn test_start_after_shutdown_is_refused() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);
    manager.shutdown().await;

    let result = manager.start(TITLE, hd(), LINK);
    assert!(matches!(result, Err(SessionError::ShuttingDown)));
}

#[tokio::test]
async fn test_repeat_start_persists_last_accessed_at() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);
    let handle = manager.start(TITLE, hd(), LINK).unwrap();
    download_all(&swarm, &handle).await;
    let before = record::load(handle.dir()).await.unwrap().unwrap().last_accessed_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let again = manager.start(TITLE, hd(), LINK).unwrap();
    let touched = again.snapshot().last_accessed_at;
    assert!(touched > before);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stored = record::load(handle.dir()).await.unwrap().unwrap();
        if stored.last_accessed_at == touched {
            assert_eq!(stored.state, SessionState::Completed);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "record never saved");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_retry_waiters_survive_previous_failure() {
    let dir = TempDir::new().unwrap();
    let swarm = Arc::new(SimulatedSwarm::new(1000, 100));
    let manager = manager(dir.path(), &swarm);
    let handle = manager.start(TITLE, hd(), LINK).unwrap();
    let storage = handle
        .await_storage(WAIT, &CancellationToken::new())
        .await
        .unwrap();

    let error = SwarmError::Io(std::io::Error::other("disk full"));
    assert!(swarm.inject_error(LINK, error).await);
    assert_eq!(
        handle.wait_for_state(is(SessionState::Failed), WAIT).await,
        Some(SessionState::Failed)
    );

    let retried = manager.start(TITLE, hd(), LINK).unwrap();
    assert_eq!(
        retried.wait_for_state(is(SessionState::Downloading), WAIT).await,
        Some(SessionState::Downloading)
    );
    let reused = retried.storage().unwrap();
    assert!(Arc::ptr_eq(&storage, &reused));

    let waiter = {
        let storage = Arc::clone(&reused);
        tokio::spawn(async move {
            storage
                .await_available(500, 599, WAIT, &CancellationToken::new())
                .await
        })
    };
    while reused.waiter_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(swarm.deliver_piece(LINK, 5).await);
    assert_eq!(waiter.await.unwrap().unwrap(), WaitOutcome::Ready);
}
