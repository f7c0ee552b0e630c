//! Catch-up subscriptions
//!
//! Each subscription runs one single-slot worker task: it replays
//! history from its starting cursor, then idles on the notifier and
//! re-enters a catch-up pass per signal. Signals arriving while a pass
//! is running are absorbed — the pass re-reads from the then-current
//! cursor, so nothing is missed and passes never stack.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::StoreResult;
use crate::message::{StreamId, StreamMessage};
use crate::notifier::{Listener, Notifier};
use crate::position::{Position, ReadDirection, Version};
use crate::reader;
use crate::store::{Inner, StreamStore};

/// Error type a handler may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives a subscription's messages.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// Called once per message, in position order. An error faults the
    /// subscription.
    async fn handle(&self, message: StreamMessage) -> Result<(), HandlerError>;

    /// Called once, after the initial replay reaches the end of the
    /// log.
    async fn caught_up(&self) {}
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Resolving the starting cursor
    Starting,
    /// Replaying messages up to the current end
    CatchingUp,
    /// Idle, awaiting commit signals
    Live,
    /// Stopped by the caller or by store shutdown
    Cancelled,
    /// Stopped by a backend or handler failure
    Faulted,
}

/// Handle to a running subscription. Dropping it cancels the
/// subscription.
#[derive(Debug)]
pub struct Subscription {
    status_rx: watch::Receiver<SubscriptionStatus>,
    stop: watch::Sender<bool>,
}

impl Subscription {
    /// The subscription's current status.
    pub fn status(&self) -> SubscriptionStatus {
        *self.status_rx.borrow()
    }

    /// Watch status transitions.
    pub fn status_watch(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status_rx.clone()
    }

    /// Stop the subscription. A message handler already in progress
    /// finishes; no further message is delivered. Idempotent.
    pub fn cancel(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub(crate) enum Target {
    All { after: Position },
    Stream { stream_id: StreamId, after: Version },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All { .. } => write!(f, "$all"),
            Self::Stream { stream_id, .. } => write!(f, "{stream_id}"),
        }
    }
}

pub(crate) fn spawn(
    store: &StreamStore,
    target: Target,
    handler: Arc<dyn SubscriptionHandler>,
) -> Subscription {
    let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Starting);
    let (stop, stop_rx) = watch::channel(false);

    // Register with the notifier before the first read so no commit
    // between replay and going live is missed.
    let listener = store.inner.notifier.listen();
    let shutdown_rx = store.inner.shutdown.subscribe();
    let inner = Arc::downgrade(&store.inner);

    tokio::spawn(run(
        inner,
        target,
        handler,
        status_tx,
        stop_rx,
        shutdown_rx,
        listener,
    ));

    Subscription { status_rx, stop }
}

struct Worker {
    inner: Weak<Inner>,
    target: Target,
    handler: Arc<dyn SubscriptionHandler>,
    status: watch::Sender<SubscriptionStatus>,
    stop: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    /// First unread ordinal (position or stream version).
    next_from: u64,
}

async fn run(
    inner: Weak<Inner>,
    target: Target,
    handler: Arc<dyn SubscriptionHandler>,
    status: watch::Sender<SubscriptionStatus>,
    stop: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    mut listener: Listener,
) {
    let mut worker = Worker {
        inner,
        target,
        handler,
        status,
        stop,
        shutdown,
        next_from: 0,
    };

    match worker.resolve_start().await {
        Ok(true) => {}
        Ok(false) => {
            worker.finish(SubscriptionStatus::Cancelled);
            return;
        }
        Err(error) => {
            error!(subscription = %worker.target, %error, "subscription failed to start");
            worker.finish(SubscriptionStatus::Faulted);
            return;
        }
    }

    let mut caught_up_once = false;
    loop {
        worker.publish(SubscriptionStatus::CatchingUp);

        match worker.catch_up().await {
            Ok(true) => {}
            Ok(false) => {
                worker.finish(SubscriptionStatus::Cancelled);
                return;
            }
            Err(error) => {
                error!(subscription = %worker.target, %error, "subscription catch-up failed");
                worker.finish(SubscriptionStatus::Faulted);
                return;
            }
        }

        if !caught_up_once {
            caught_up_once = true;
            worker.handler.caught_up().await;
        }
        worker.publish(SubscriptionStatus::Live);

        tokio::select! {
            changed = worker.stop.changed() => {
                if changed.is_err() || *worker.stop.borrow() {
                    worker.finish(SubscriptionStatus::Cancelled);
                    return;
                }
            }
            changed = worker.shutdown.changed() => {
                if changed.is_err() || *worker.shutdown.borrow() {
                    worker.finish(SubscriptionStatus::Cancelled);
                    return;
                }
            }
            signal = listener.recv() => {
                if signal.is_none() {
                    worker.finish(SubscriptionStatus::Cancelled);
                    return;
                }
                debug!(subscription = %worker.target, "commit signal, re-entering catch-up");
            }
        }
    }
}

impl Worker {
    fn publish(&self, status: SubscriptionStatus) {
        let _ = self.status.send(status);
    }

    fn finish(&self, status: SubscriptionStatus) {
        debug!(subscription = %self.target, ?status, "subscription stopped");
        self.publish(status);
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow() || *self.shutdown.borrow()
    }

    fn upgrade(&self) -> Option<StreamStore> {
        self.inner.upgrade().map(StreamStore::from_inner)
    }

    /// Resolve the starting cursor. `Ok(false)` means the store is
    /// already gone.
    async fn resolve_start(&mut self) -> StoreResult<bool> {
        let Some(store) = self.upgrade() else {
            return Ok(false);
        };

        let last_seen = match &self.target {
            Target::All { after } => match after {
                Position::Start => None,
                Position::At(p) => Some(*p),
                Position::End => store.inner.adaptor.head_position().await?,
            },
            Target::Stream { stream_id, after } => match after {
                Version::Start => None,
                Version::At(v) => Some(*v),
                Version::End => store.inner.adaptor.stream_head(stream_id).await?.version(),
            },
        };

        self.next_from = last_seen.map_or(0, |seen| seen.saturating_add(1));
        Ok(true)
    }

    /// One catch-up pass. `Ok(false)` means the subscription should
    /// stop without fault.
    async fn catch_up(&mut self) -> StoreResult<bool> {
        loop {
            if self.stopped() {
                return Ok(false);
            }
            let Some(store) = self.upgrade() else {
                return Ok(false);
            };

            let (messages, next_from, is_end) = self.read_page(&store).await?;
            drop(store);

            for (ordinal, message) in messages {
                if self.stopped() {
                    return Ok(false);
                }
                self.handler
                    .handle(message)
                    .await
                    .map_err(|e| crate::error::StoreError::backend(format!("handler: {e}")))?;
                self.next_from = ordinal + 1;
            }

            // Advance past rows the reader filtered out as expired.
            self.next_from = self.next_from.max(next_from);

            if is_end {
                return Ok(true);
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn read_page(
        &self,
        store: &StreamStore,
    ) -> StoreResult<(Vec<(u64, StreamMessage)>, u64, bool)> {
        let page_size = store.inner.config.subscription_page_size;
        let prefetch = store.inner.config.subscription_prefetch;

        match &self.target {
            Target::All { .. } => {
                let page = reader::read_all(
                    store.clone(),
                    ReadDirection::Forward,
                    Position::At(self.next_from),
                    page_size,
                    prefetch,
                )
                .await?;
                let next = page.next_position.at().unwrap_or(self.next_from);
                let messages = page
                    .messages
                    .into_iter()
                    .map(|m| (m.position, m))
                    .collect();
                Ok((messages, next, page.is_end))
            }
            Target::Stream { stream_id, .. } => {
                let page = reader::read_stream(
                    store.clone(),
                    stream_id.clone(),
                    ReadDirection::Forward,
                    Version::At(self.next_from),
                    page_size,
                    prefetch,
                )
                .await?;
                let next = page.next_version.at().unwrap_or(self.next_from);
                let messages = page
                    .messages
                    .into_iter()
                    .map(|m| (m.stream_version, m))
                    .collect();
                Ok((messages, next, page.is_end))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::StoreError;
    use crate::message::{ExpectedVersion, NewMessage};
    use crate::testing::FakeAdaptor;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl SubscriptionHandler for Arc<Collector> {
        async fn handle(&self, message: StreamMessage) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(message.position);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl SubscriptionHandler for FailingHandler {
        async fn handle(&self, _message: StreamMessage) -> Result<(), HandlerError> {
            Err("handler rejected message".into())
        }
    }

    async fn wait_for_status(subscription: &Subscription, wanted: SubscriptionStatus) {
        let mut statuses = subscription.status_watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *statuses.borrow() != wanted {
                statuses.changed().await.expect("status channel closed");
            }
        })
        .await
        .expect("timed out waiting for status");
    }

    fn message() -> NewMessage {
        NewMessage::new(Uuid::new_v4(), "t", "{}")
    }

    #[tokio::test]
    async fn replays_then_delivers_live_appends() {
        let store = StreamStore::new(FakeAdaptor::default(), StoreConfig::default());
        let stream_id = StreamId::from("s");

        for _ in 0..3 {
            store
                .append_to_stream(&stream_id, ExpectedVersion::Any, vec![message()])
                .await
                .unwrap();
        }

        let collector = Arc::new(Collector::default());
        let subscription = store
            .subscribe_to_all(Position::Start, Arc::clone(&collector))
            .unwrap();

        wait_for_status(&subscription, SubscriptionStatus::Live).await;

        for _ in 0..2 {
            store
                .append_to_stream(&stream_id, ExpectedVersion::Any, vec![message()])
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if collector.seen.lock().unwrap().len() == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for deliveries");

        assert_eq!(*collector.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn backend_failure_faults_the_subscription() {
        let adaptor = FakeAdaptor::with_positions("s", &[0, 1]);
        adaptor.fail_reads.store(true, Ordering::SeqCst);
        let store = StreamStore::new(adaptor, StoreConfig::default());

        let subscription = store
            .subscribe_to_all(Position::Start, Arc::new(Collector::default()))
            .unwrap();

        wait_for_status(&subscription, SubscriptionStatus::Faulted).await;
    }

    #[tokio::test]
    async fn handler_failure_faults_the_subscription() {
        let store = StreamStore::new(
            FakeAdaptor::with_positions("s", &[0]),
            StoreConfig::default(),
        );

        let subscription = store
            .subscribe_to_all(Position::Start, FailingHandler)
            .unwrap();

        wait_for_status(&subscription, SubscriptionStatus::Faulted).await;
    }

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let store = StreamStore::new(FakeAdaptor::default(), StoreConfig::default());
        let collector = Arc::new(Collector::default());

        let subscription = store
            .subscribe_to_all(Position::Start, Arc::clone(&collector))
            .unwrap();
        wait_for_status(&subscription, SubscriptionStatus::Live).await;

        subscription.cancel();
        wait_for_status(&subscription, SubscriptionStatus::Cancelled).await;

        store
            .append_to_stream(&StreamId::from("s"), ExpectedVersion::Any, vec![message()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(collector.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_shutdown_cancels_subscriptions() {
        let store = StreamStore::new(FakeAdaptor::default(), StoreConfig::default());
        let subscription = store
            .subscribe_to_all(Position::Start, Arc::new(Collector::default()))
            .unwrap();
        wait_for_status(&subscription, SubscriptionStatus::Live).await;

        store.shutdown();
        wait_for_status(&subscription, SubscriptionStatus::Cancelled).await;

        assert!(matches!(
            store.head_position().await,
            Err(StoreError::Disposed)
        ));
    }
}
