//! Paged reading over the all-stream and individual streams

use uuid::Uuid;
use weir_store::{
    ExpectedVersion, NewMessage, Position, StoreConfig, StreamId, StreamStore, Version,
};
use weir_store_memory::MemoryAdaptor;

fn store() -> StreamStore {
    StreamStore::new(MemoryAdaptor::new(), StoreConfig::default())
}

fn message() -> NewMessage {
    NewMessage::new(Uuid::new_v4(), "event", r#"{"ok":true}"#)
}

async fn append_n(store: &StreamStore, stream_id: &StreamId, n: usize) -> Vec<Uuid> {
    let messages: Vec<NewMessage> = (0..n).map(|_| message()).collect();
    let ids = messages.iter().map(|m| m.message_id).collect();
    store
        .append_to_stream(stream_id, ExpectedVersion::Any, messages)
        .await
        .unwrap();
    ids
}

/// Leaves the log with messages at positions {0, 2, 5, 7}.
async fn store_with_gaps() -> (StreamStore, StreamId) {
    let store = store();
    let stream_id = StreamId::from("gappy");
    let ids = append_n(&store, &stream_id, 8).await;

    for index in [1, 3, 4, 6] {
        assert!(
            store
                .delete_message(&stream_id, ids[index])
                .await
                .unwrap()
        );
    }

    (store, stream_id)
}

fn positions(page: &weir_store::ReadAllPage) -> Vec<u64> {
    page.messages.iter().map(|m| m.position).collect()
}

#[tokio::test]
async fn forward_paging_tolerates_gaps() {
    let (store, _) = store_with_gaps().await;

    let page = store
        .read_all_forwards(Position::At(1), 2, true)
        .await
        .unwrap();
    assert_eq!(positions(&page), vec![2, 5]);
    assert!(!page.is_end);
    assert_eq!(page.next_position, Position::At(6));

    let page = page.read_next().await.unwrap();
    assert_eq!(positions(&page), vec![7]);
    assert!(page.is_end);
}

#[tokio::test]
async fn backward_from_end_mirrors_forward_from_start() {
    let (store, _) = store_with_gaps().await;

    let mut forward = Vec::new();
    let mut page = store
        .read_all_forwards(Position::Start, 3, true)
        .await
        .unwrap();
    loop {
        forward.extend(positions(&page));
        if page.is_end {
            break;
        }
        page = page.read_next().await.unwrap();
    }

    let mut backward = Vec::new();
    let mut page = store
        .read_all_backwards(Position::End, 3, true)
        .await
        .unwrap();
    loop {
        backward.extend(positions(&page));
        if page.is_end {
            break;
        }
        page = page.read_next().await.unwrap();
    }

    backward.reverse();
    assert_eq!(forward, vec![0, 2, 5, 7]);
    assert_eq!(forward, backward);
}

#[tokio::test]
async fn empty_store_pages_are_terminal() {
    let store = store();

    let page = store
        .read_all_forwards(Position::Start, 10, true)
        .await
        .unwrap();
    assert!(page.messages.is_empty());
    assert!(page.is_end);
    assert_eq!(page.next_position, Position::Start);

    let page = store
        .read_all_backwards(Position::End, 10, true)
        .await
        .unwrap();
    assert!(page.messages.is_empty());
    assert!(page.is_end);
    assert_eq!(page.from_position, Position::Start);
}

#[tokio::test]
async fn missing_stream_reads_as_empty_end_page() {
    let store = store();

    let page = store
        .read_stream_forwards(&StreamId::from("absent"), Version::Start, 10, true)
        .await
        .unwrap();
    assert!(page.messages.is_empty());
    assert!(page.is_end);
}

#[tokio::test]
async fn stream_reads_page_both_ways() {
    let store = store();
    let stream_id = StreamId::from("s");
    append_n(&store, &stream_id, 5).await;

    let page = store
        .read_stream_forwards(&stream_id, Version::At(1), 2, true)
        .await
        .unwrap();
    let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![1, 2]);
    assert!(!page.is_end);
    assert_eq!(page.next_version, Version::At(3));

    let page = store
        .read_stream_backwards(&stream_id, Version::End, 2, true)
        .await
        .unwrap();
    let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![4, 3]);
    assert!(!page.is_end);

    let page = page.read_next().await.unwrap();
    let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![2, 1]);
}

#[tokio::test]
async fn lazy_pages_defer_payload_loading() {
    let store = store();
    let stream_id = StreamId::from("s");
    append_n(&store, &stream_id, 1).await;

    let page = store
        .read_stream_forwards(&stream_id, Version::Start, 10, false)
        .await
        .unwrap();
    let message = &page.messages[0];

    assert_eq!(
        message.json_data().await.unwrap(),
        Some(r#"{"ok":true}"#.to_string())
    );
}

#[tokio::test]
async fn lazy_payload_of_deleted_message_reads_none() {
    let store = store();
    let stream_id = StreamId::from("s");
    let ids = append_n(&store, &stream_id, 1).await;

    let page = store
        .read_stream_forwards(&stream_id, Version::Start, 10, false)
        .await
        .unwrap();
    let message = page.messages[0].clone();

    store.delete_message(&stream_id, ids[0]).await.unwrap();

    // The loader holds plain identifiers, so it observes the deletion
    // instead of a stale cursor.
    assert_eq!(message.json_data().await.unwrap(), None);
}
