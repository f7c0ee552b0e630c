//! Commit notification
//!
//! A notifier owns exactly one capability: hand out listeners that
//! resolve, with no payload, every time the log advances. Signals are
//! at-least-once per commit and coalesce under lag; a listener
//! registered after a commit is not guaranteed a signal for it, so
//! subscribers always reconcile by position rather than by counting
//! signals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::adaptor::Adaptor;

const SIGNAL_BUFFER: usize = 16;

/// Source of log-advanced signals.
pub trait Notifier: Send + Sync {
    /// Register a listener. Dropping the listener unregisters it.
    fn listen(&self) -> Listener;
}

/// A registered listener on a notifier.
pub struct Listener {
    rx: broadcast::Receiver<()>,
}

impl Listener {
    /// Wait for the next signal.
    ///
    /// Missed signals coalesce: after a lag this resolves once and the
    /// caller re-checks its cursor. Returns `None` when the notifier
    /// has shut down.
    pub async fn recv(&mut self) -> Option<()> {
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(()),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// In-process notifier fired directly by the store after each commit.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<()>,
}

impl BroadcastNotifier {
    /// Create a notifier with no listeners.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SIGNAL_BUFFER);
        Self { tx }
    }

    /// Signal every current listener.
    pub fn notify(&self) {
        // No receivers is fine; subscribers catch up on registration.
        let _ = self.tx.send(());
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for BroadcastNotifier {
    fn listen(&self) -> Listener {
        Listener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Notifier for stores written to by other processes: polls the
/// backend's head position on an interval and signals when it moves.
pub struct PollingNotifier {
    tx: broadcast::Sender<()>,
    stop: watch::Sender<bool>,
}

impl PollingNotifier {
    /// Start polling the given adaptor.
    pub fn start(adaptor: Arc<dyn Adaptor>, poll_interval: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(SIGNAL_BUFFER);
        let (stop, mut stop_rx) = watch::channel(false);

        let signal = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_head: Option<u64> = None;

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match adaptor.head_position().await {
                            Ok(head) => {
                                if head > last_head {
                                    last_head = head;
                                    let _ = signal.send(());
                                }
                            }
                            Err(error) => {
                                warn!(%error, "head position poll failed");
                            }
                        }
                    }
                }
            }

            debug!("polling notifier stopped");
        });

        Self { tx, stop }
    }

    /// Stop the polling task. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Notifier for PollingNotifier {
    fn listen(&self) -> Listener {
        Listener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Drop for PollingNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listeners_each_receive_a_signal() {
        let notifier = BroadcastNotifier::new();
        let mut a = notifier.listen();
        let mut b = notifier.listen();

        notifier.notify();

        assert_eq!(a.recv().await, Some(()));
        assert_eq!(b.recv().await, Some(()));
    }

    #[tokio::test]
    async fn lagged_listener_coalesces() {
        let notifier = BroadcastNotifier::new();
        let mut listener = notifier.listen();

        for _ in 0..(SIGNAL_BUFFER * 4) {
            notifier.notify();
        }

        // One wakeup is enough; the cursor re-check sees everything.
        assert_eq!(listener.recv().await, Some(()));
    }

    #[tokio::test]
    async fn closed_notifier_ends_listener() {
        let notifier = BroadcastNotifier::new();
        let mut listener = notifier.listen();
        drop(notifier);

        assert_eq!(listener.recv().await, None);
    }

    #[tokio::test]
    async fn polling_notifier_signals_when_the_head_advances() {
        use crate::adaptor::AppendCondition;
        use crate::message::{NewMessage, StreamId};
        use crate::testing::FakeAdaptor;
        use uuid::Uuid;

        let adaptor = Arc::new(FakeAdaptor::default());
        let notifier = PollingNotifier::start(
            Arc::clone(&adaptor) as Arc<dyn Adaptor>,
            Duration::from_millis(10),
        );
        let mut listener = notifier.listen();

        adaptor
            .commit_append(
                &StreamId::from("s"),
                AppendCondition::Always,
                &[NewMessage::new(Uuid::new_v4(), "t", "{}")],
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .expect("timed out waiting for poll signal")
            .expect("notifier closed");

        notifier.stop();
    }
}
