//! Store lifecycle: schema probe, deletion, shutdown

use uuid::Uuid;
use weir_store::{
    ExpectedVersion, NewMessage, Position, StoreConfig, StoreError, StreamId, StreamStore,
};
use weir_store_memory::MemoryAdaptor;

fn store() -> StreamStore {
    StreamStore::new(MemoryAdaptor::new(), StoreConfig::default())
}

fn message() -> NewMessage {
    NewMessage::new(Uuid::new_v4(), "event", "{}")
}

#[tokio::test]
async fn check_schema_matches_current() {
    let store = store();
    let result = store.check_schema().await.unwrap();
    assert!(result.is_match());
    assert!(result.ensure_match().is_ok());
}

#[tokio::test]
async fn missing_stream_count_is_an_error_empty_stream_is_not() {
    let store = store();
    let stream_id = StreamId::from("s");

    assert!(matches!(
        store.stream_message_count(&stream_id).await,
        Err(StoreError::StreamNotFound(_))
    ));

    store
        .append_to_stream(&stream_id, ExpectedVersion::NoStream, Vec::new())
        .await
        .unwrap();
    assert_eq!(store.stream_message_count(&stream_id).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_stream_removes_its_messages() {
    let store = store();
    let stream_id = StreamId::from("s");

    store
        .append_to_stream(&stream_id, ExpectedVersion::Any, vec![message(), message()])
        .await
        .unwrap();

    assert!(store.delete_stream(&stream_id).await.unwrap());
    assert!(!store.delete_stream(&stream_id).await.unwrap());

    let page = store
        .read_all_forwards(Position::Start, 10, true)
        .await
        .unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn drop_all_resets_the_store() {
    let store = store();
    store
        .append_to_stream(&StreamId::from("s"), ExpectedVersion::Any, vec![message()])
        .await
        .unwrap();

    store.drop_all().await.unwrap();

    assert_eq!(store.head_position().await.unwrap(), None);
}

#[tokio::test]
async fn disposed_store_rejects_every_operation() {
    let store = store();
    store.shutdown();
    store.shutdown(); // idempotent

    assert!(matches!(
        store.head_position().await,
        Err(StoreError::Disposed)
    ));
    assert!(matches!(
        store
            .append_to_stream(&StreamId::from("s"), ExpectedVersion::Any, vec![message()])
            .await,
        Err(StoreError::Disposed)
    ));
    assert!(matches!(
        store.read_all_forwards(Position::Start, 10, true).await,
        Err(StoreError::Disposed)
    ));
    assert!(matches!(
        store.check_schema().await,
        Err(StoreError::Disposed)
    ));
    assert!(
        store
            .subscribe_to_all(Position::Start, NoopHandler)
            .is_err()
    );
}

#[tokio::test]
async fn continuations_observe_disposal() {
    let store = store();
    store
        .append_to_stream(&StreamId::from("s"), ExpectedVersion::Any, vec![message()])
        .await
        .unwrap();

    let page = store
        .read_all_forwards(Position::Start, 10, true)
        .await
        .unwrap();

    store.shutdown();

    assert!(matches!(page.read_next().await, Err(StoreError::Disposed)));
}

struct NoopHandler;

#[async_trait::async_trait]
impl weir_store::SubscriptionHandler for NoopHandler {
    async fn handle(
        &self,
        _message: weir_store::StreamMessage,
    ) -> Result<(), weir_store::HandlerError> {
        Ok(())
    }
}
