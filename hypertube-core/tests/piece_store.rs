//! Piece store behavior seen from outside the crate.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hypertube_core::storage::ByteRange;
use hypertube_core::streaming::AvailabilityReporter;
use hypertube_core::{PieceStore, Quality, SessionId, WaitOutcome};
use proptest::prelude::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn session(title_id: &str) -> SessionId {
    SessionId::new(title_id, Quality::from_height(1080).unwrap()).unwrap()
}

async fn registered(dir: &TempDir, id: &SessionId, total_size: u64) -> Arc<PieceStore> {
    let store = Arc::new(PieceStore::new());
    store
        .register(id, &dir.path().join(format!("{id}.mp4")), total_size)
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_range_head_waits_for_byte_99() {
    let dir = TempDir::new().unwrap();
    let id = session("tt1");
    let store = registered(&dir, &id, 1000).await;
    store.write(&id, 0, Bytes::from(vec![7u8; 50])).await.unwrap();

    let waiter = {
        let store = Arc::clone(&store);
        let id = id.clone();
        tokio::spawn(async move {
            store
                .await_available(&id, 0, 99, Duration::from_secs(5), &CancellationToken::new())
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!store.is_available(&id, 0, 99).unwrap());
    assert!(!waiter.is_finished());

    store.write(&id, 50, Bytes::from(vec![8u8; 50])).await.unwrap();
    assert_eq!(waiter.await.unwrap(), WaitOutcome::Ready);

    let data = store.read(&id, 0, 99).await.unwrap();
    assert_eq!(&data[..50], &[7u8; 50][..]);
    assert_eq!(&data[50..], &[8u8; 50][..]);
}

#[tokio::test]
async fn test_writes_to_other_sessions_do_not_satisfy_waiters() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(PieceStore::new());
    let a = session("tta");
    let b = session("ttb");
    store.register(&a, &dir.path().join("a.mp4"), 1000).await.unwrap();
    store.register(&b, &dir.path().join("b.mp4"), 1000).await.unwrap();

    let waiter = {
        let store = Arc::clone(&store);
        let a = a.clone();
        tokio::spawn(async move {
            store
                .await_available(&a, 0, 99, Duration::from_millis(200), &CancellationToken::new())
                .await
                .unwrap()
        })
    };
    store.write(&b, 0, Bytes::from(vec![1u8; 1000])).await.unwrap();

    assert_eq!(waiter.await.unwrap(), WaitOutcome::TimedOut);
    assert!(store.is_available(&b, 0, 999).unwrap());
    assert!(!store.is_available(&a, 0, 0).unwrap());
}

#[tokio::test]
async fn test_concurrent_readers_and_writers() {
    let dir = TempDir::new().unwrap();
    let id = session("tt1");
    let store = registered(&dir, &id, 10_000).await;

    let mut readers = Vec::new();
    for piece in 0..100u64 {
        let store = Arc::clone(&store);
        let id = id.clone();
        readers.push(tokio::spawn(async move {
            let start = piece * 100;
            let outcome = store
                .await_available(
                    &id,
                    start,
                    start + 99,
                    Duration::from_secs(10),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(outcome, WaitOutcome::Ready);
            store.read(&id, start, start + 99).await.unwrap()
        }));
    }

    let mut writers = Vec::new();
    for piece in (0..100u64).rev() {
        let store = Arc::clone(&store);
        let id = id.clone();
        writers.push(tokio::spawn(async move {
            let data = Bytes::from(vec![piece as u8; 100]);
            store.write(&id, piece * 100, data).await.unwrap();
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    for (piece, reader) in readers.into_iter().enumerate() {
        let data = reader.await.unwrap();
        assert!(data.iter().all(|byte| *byte == piece as u8));
    }
    assert_eq!(store.storage(&id).unwrap().waiter_count(), 0);
}

fn covered(ranges: &[ByteRange]) -> BTreeSet<u64> {
    ranges.iter().flat_map(|range| range.start..range.end).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_availability_matches_written_bytes(
        writes in proptest::collection::vec((0u64..400, 1u64..80), 1..24),
        queries in proptest::collection::vec((0u64..400, 0u64..40), 1..16),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let id = session("tt1");
            let total = 400u64;
            let store = registered(&dir, &id, total).await;
            let reporter = AvailabilityReporter::new(Arc::clone(&store));

            let mut written = BTreeSet::new();
            let mut last_progress = 0.0;
            for (offset, len) in writes {
                let len = len.min(total - offset);
                store
                    .write(&id, offset, Bytes::from(vec![0u8; len as usize]))
                    .await
                    .unwrap();
                written.extend(offset..offset + len);

                let progress = reporter.progress_percent(&id).unwrap();
                prop_assert!(progress >= last_progress);
                last_progress = progress;
            }

            let ranges = reporter.contiguous_ranges_from(&id, 0).unwrap();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
            prop_assert!(ranges.iter().all(|range| range.start < range.end));
            prop_assert_eq!(covered(&ranges), written.clone());

            for (start, len) in queries {
                let end = (start + len).min(total - 1);
                let expected = (start..=end).all(|byte| written.contains(&byte));
                prop_assert_eq!(store.is_available(&id, start, end).unwrap(), expected);
            }
            Ok(())
        })?;
    }
}
