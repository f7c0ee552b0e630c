//! Stream metadata and retention enforcement

use std::time::Duration;

use uuid::Uuid;
use weir_store::{
    ExpectedVersion, NewMessage, Position, StoreConfig, StreamId, StreamStore, Version,
};
use weir_store_memory::MemoryAdaptor;

fn store() -> StreamStore {
    StreamStore::new(
        MemoryAdaptor::new(),
        StoreConfig {
            // Retention reads the policy through the cache; zero TTL
            // keeps these tests from observing stale entries.
            metadata_cache_ttl: Duration::ZERO,
            ..StoreConfig::default()
        },
    )
}

fn message() -> NewMessage {
    NewMessage::new(Uuid::new_v4(), "event", "{}")
}

#[tokio::test]
async fn metadata_round_trips() {
    let store = store();
    let stream_id = StreamId::from("s");

    store
        .set_stream_metadata(&stream_id, Some(Duration::from_secs(30)), Some(10))
        .await
        .unwrap();

    let metadata = store.get_stream_metadata(&stream_id).await.unwrap();
    assert_eq!(metadata.max_age, Some(Duration::from_secs(30)));
    assert_eq!(metadata.max_count, Some(10));
}

#[tokio::test]
async fn unknown_stream_has_empty_metadata() {
    let store = store();
    let metadata = store
        .get_stream_metadata(&StreamId::from("absent"))
        .await
        .unwrap();
    assert_eq!(metadata.max_age, None);
    assert_eq!(metadata.max_count, None);
}

#[tokio::test]
async fn max_count_purges_oldest_messages() {
    let store = store();
    let stream_id = StreamId::from("s");

    store
        .set_stream_metadata(&stream_id, None, Some(2))
        .await
        .unwrap();

    for _ in 0..5 {
        store
            .append_to_stream(&stream_id, ExpectedVersion::Any, vec![message()])
            .await
            .unwrap();
    }

    assert_eq!(store.stream_message_count(&stream_id).await.unwrap(), 2);

    let page = store
        .read_stream_forwards(&stream_id, Version::Start, 10, true)
        .await
        .unwrap();
    let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![3, 4]);
}

#[tokio::test]
async fn expired_messages_are_filtered_from_stream_reads() {
    let store = store();
    let stream_id = StreamId::from("s");

    store
        .append_to_stream(&stream_id, ExpectedVersion::Any, vec![message()])
        .await
        .unwrap();

    // Everything already written is instantly expired.
    store
        .set_stream_metadata(&stream_id, Some(Duration::ZERO), None)
        .await
        .unwrap();

    let page = store
        .read_stream_forwards(&stream_id, Version::Start, 10, true)
        .await
        .unwrap();
    assert!(page.messages.is_empty());
    assert!(page.is_end);

    // A generous max-age makes them visible again.
    store
        .set_stream_metadata(&stream_id, Some(Duration::from_secs(3600)), None)
        .await
        .unwrap();

    let page = store
        .read_stream_forwards(&stream_id, Version::Start, 10, true)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 1);
}

#[tokio::test]
async fn expired_messages_are_filtered_from_all_stream_reads() {
    let store = store();
    let expiring = StreamId::from("expiring");
    let durable = StreamId::from("durable");

    store
        .set_stream_metadata(&expiring, Some(Duration::ZERO), None)
        .await
        .unwrap();

    store
        .append_to_stream(&expiring, ExpectedVersion::Any, vec![message()])
        .await
        .unwrap();
    store
        .append_to_stream(&durable, ExpectedVersion::Any, vec![message()])
        .await
        .unwrap();

    let page = store
        .read_all_forwards(Position::Start, 10, true)
        .await
        .unwrap();
    let streams: Vec<&str> = page
        .messages
        .iter()
        .map(|m| m.stream_id.as_str())
        .collect();
    assert_eq!(streams, vec!["durable"]);
    // The skipped message does not disturb the cursor.
    assert_eq!(page.next_position, Position::At(2));
}
