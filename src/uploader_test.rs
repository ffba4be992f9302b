// ============================================================================
// MultipartUploader Tests
// ============================================================================

use std::io::Cursor;
use std::sync::Arc;

use crate::config::MAX_PART_BYTES;
use crate::store::memory::MemoryStore;
use crate::store::{ObjectStore, StoreError};

use super::MultipartUploader;

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn drain(
    store: Arc<MemoryStore>,
    input: Vec<u8>,
) -> (Arc<MemoryStore>, Arc<MultipartUploader>) {
    let store_dyn: Arc<dyn ObjectStore> = store.clone();
    let uploader = Arc::new(
        MultipartUploader::new(store_dyn, "pipeline_1")
            .await
            .unwrap(),
    );

    Arc::clone(&uploader)
        .run(Cursor::new(input))
        .await
        .unwrap();

    (store, uploader)
}

#[tokio::test]
async fn stream_is_split_into_bounded_parts() {
    let input = pattern_bytes(2 * MAX_PART_BYTES + 123);
    let (store, uploader) = drain(Arc::new(MemoryStore::new()), input.clone()).await;

    let completed = uploader.complete().await.unwrap();
    assert!(completed.recording_url.ends_with("recording_pipeline_1.mp4"));

    let state = store.state.lock().unwrap();
    let (path, parts) = state.uploads.values().next().unwrap();
    assert_eq!(path, "recording_pipeline_1.mp4");
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[&1].len(), MAX_PART_BYTES);
    assert_eq!(parts[&2].len(), MAX_PART_BYTES);
    assert_eq!(parts[&3].len(), 123);
    drop(state);

    // The reassembled object is byte-identical to the encoder stream.
    assert_eq!(store.object_bytes("recording_pipeline_1.mp4"), input);
}

#[tokio::test]
async fn exact_multiple_produces_no_empty_tail_part() {
    let input = pattern_bytes(MAX_PART_BYTES);
    let (store, uploader) = drain(Arc::new(MemoryStore::new()), input.clone()).await;

    uploader.complete().await.unwrap();

    let state = store.state.lock().unwrap();
    let (_, parts) = state.uploads.values().next().unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[&1].len(), MAX_PART_BYTES);
}

#[tokio::test]
async fn short_stream_becomes_a_single_part() {
    let input = b"tiny fragment".to_vec();
    let (store, uploader) = drain(Arc::new(MemoryStore::new()), input.clone()).await;

    uploader.complete().await.unwrap();
    assert_eq!(store.object_bytes("recording_pipeline_1.mp4"), input);
}

#[tokio::test]
async fn empty_stream_dispatches_nothing() {
    let (store, uploader) = drain(Arc::new(MemoryStore::new()), Vec::new()).await;

    uploader.complete().await.unwrap();

    let state = store.state.lock().unwrap();
    let completed = state.completed.get("recording_pipeline_1.mp4").unwrap();
    assert!(completed.is_empty());
}

#[tokio::test]
async fn completion_parts_are_sorted_by_number() {
    // Part 1 is held back so part 2 finishes first.
    let store = Arc::new(MemoryStore::delayed(vec![1]));
    let input = pattern_bytes(MAX_PART_BYTES + 17);
    let (store, uploader) = drain(store, input).await;

    uploader.complete().await.unwrap();

    let state = store.state.lock().unwrap();
    let completed = state.completed.get("recording_pipeline_1.mp4").unwrap();
    let numbers: Vec<i32> = completed.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn failed_part_fails_completion_loudly() {
    let store = Arc::new(MemoryStore::failing(vec![2]));
    let input = pattern_bytes(2 * MAX_PART_BYTES + 5);
    let (store, uploader) = drain(store, input).await;

    let err = uploader.complete().await.unwrap_err();
    match err {
        StoreError::IncompleteUpload { missing, .. } => assert_eq!(missing, vec![2]),
        other => panic!("expected IncompleteUpload, got {other}"),
    }

    // Nothing was committed.
    let state = store.state.lock().unwrap();
    assert!(state.completed.is_empty());
}
