use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::core::{decode_message, EventError, EventMessage, SubscriptionKind};
use crate::messaging::SubscriptionId;
use crate::metrics::EventMetrics;

// ============================================================================
// Subscriptions
// ============================================================================
//
// A subscription is a broker registration plus one supervised task:
// - Callback mode: the task decodes each payload and calls the handler.
// - Stream mode: the task relays decoded messages into a bounded output
//   queue that the caller drains as a `MessageStream`.
//
// Every wait inside the task also watches the cancellation token, so
// shutting a subscription down never leaves the task parked on a queue.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Callback,
    Stream,
}

pub(crate) struct ActiveSubscription {
    pub broker_id: SubscriptionId,
    pub mode: DeliveryMode,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    pub fn new(
        broker_id: SubscriptionId,
        mode: DeliveryMode,
        token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            broker_id,
            mode,
            token,
            task,
        }
    }

    /// True once the task has ended, whether or not it was cancelled
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task without waiting for it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel the task and wait for it to finish, aborting it if it
    /// outlives `timeout`. Returns false if it had to be aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        self.token.cancel();

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(
                    error = %e,
                    mode = ?self.mode,
                    "Subscription task ended abnormally"
                );
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    mode = ?self.mode,
                    "Subscription task did not stop in time, aborting"
                );
                self.task.abort();
                false
            }
        }
    }
}

impl std::fmt::Debug for ActiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSubscription")
            .field("broker_id", &self.broker_id)
            .field("mode", &self.mode)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Active subscriptions, at most one per kind
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    active: HashMap<SubscriptionKind, ActiveSubscription>,
}

impl SubscriptionRegistry {
    /// True if `kind` has a subscription whose task is still running
    pub fn contains(&self, kind: SubscriptionKind) -> bool {
        self.active
            .get(&kind)
            .is_some_and(|subscription| !subscription.is_finished())
    }

    /// Take out an entry whose task already ended, freeing the slot
    pub fn take_finished(&mut self, kind: SubscriptionKind) -> Option<ActiveSubscription> {
        if self.active.get(&kind)?.is_finished() {
            return self.active.remove(&kind);
        }
        None
    }

    /// Register a subscription. An existing entry is never replaced.
    pub fn insert(
        &mut self,
        kind: SubscriptionKind,
        subscription: ActiveSubscription,
    ) -> Result<(), (EventError, ActiveSubscription)> {
        if self.active.contains_key(&kind) {
            return Err((EventError::AlreadySubscribed(kind), subscription));
        }
        self.active.insert(kind, subscription);
        Ok(())
    }

    pub fn remove(&mut self, kind: SubscriptionKind) -> Option<ActiveSubscription> {
        self.active.remove(&kind)
    }

    pub fn drain(&mut self) -> Vec<(SubscriptionKind, ActiveSubscription)> {
        self.active.drain().collect()
    }

    pub fn cancel_all(&self) {
        for subscription in self.active.values() {
            subscription.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }
}

/// Decoded messages from a stream-mode subscription.
///
/// Single consumer. Ends once the subscription is removed or the store
/// closes; messages already queued at that point are still yielded.
pub struct MessageStream<M> {
    inner: mpsc::Receiver<M>,
}

impl<M> MessageStream<M> {
    pub(crate) fn new(inner: mpsc::Receiver<M>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) -> Option<M> {
        self.inner.recv().await
    }
}

impl<M> Stream for MessageStream<M> {
    type Item = M;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<M>> {
        self.inner.poll_recv(cx)
    }
}

/// Drive a callback-mode subscription until cancelled or the intake closes.
/// A panicking handler is logged and counted; delivery goes on.
pub(crate) async fn run_callback<M, F>(
    mut intake: mpsc::Receiver<Vec<u8>>,
    mut handler: F,
    token: CancellationToken,
    metrics: Arc<EventMetrics>,
) where
    M: EventMessage,
    F: FnMut(M) + Send + 'static,
{
    let topic = M::topic();
    tracing::debug!(topic = %topic, "Callback delivery started");

    loop {
        let payload = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            payload = intake.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        match decode_message::<M>(&payload) {
            Ok(message) => {
                metrics.record_delivered(topic);
                if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    metrics.record_handler_panic(topic);
                    tracing::error!(topic = %topic, "Subscription handler panicked");
                }
            }
            Err(e) => {
                metrics.record_decode_failed(topic);
                tracing::warn!(error = %e, bytes = payload.len(), "Skipping undecodable payload");
            }
        }
    }

    tracing::debug!(topic = %topic, "Callback delivery stopped");
}

/// Relay raw payloads from the broker into the decoded output queue
pub(crate) async fn run_relay<M>(
    mut intake: mpsc::Receiver<Vec<u8>>,
    output: mpsc::Sender<M>,
    token: CancellationToken,
    metrics: Arc<EventMetrics>,
) where
    M: EventMessage,
{
    let topic = M::topic();
    tracing::debug!(topic = %topic, "Relay started");

    loop {
        let payload = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            payload = intake.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let message = match decode_message::<M>(&payload) {
            Ok(message) => message,
            Err(e) => {
                metrics.record_decode_failed(topic);
                tracing::warn!(error = %e, bytes = payload.len(), "Skipping undecodable payload");
                continue;
            }
        };

        // Blocks while the consumer is behind
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sent = output.send(message) => {
                if sent.is_err() {
                    tracing::debug!(topic = %topic, "Stream consumer dropped");
                    break;
                }
                metrics.record_delivered(topic);
            }
        }
    }

    tracing::debug!(topic = %topic, "Relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::core::{encode_message, PostCreatedMessage};
    use chrono::Utc;
    use futures_util::StreamExt;
    use tokio::time::timeout;

    fn idle_subscription(broker_id: SubscriptionId) -> ActiveSubscription {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move { child.cancelled().await });
        ActiveSubscription::new(broker_id, DeliveryMode::Stream, token, task)
    }

    #[tokio::test]
    async fn test_registry_refuses_second_entry() {
        let mut registry = SubscriptionRegistry::default();
        registry.insert(SubscriptionKind::PostCreated, idle_subscription(1)).unwrap();

        let (err, rejected) = match registry.insert(SubscriptionKind::PostCreated, idle_subscription(2)) {
            Err(rejected) => rejected,
            Ok(()) => panic!("second insert should fail"),
        };

        assert!(matches!(err, EventError::AlreadySubscribed(SubscriptionKind::PostCreated)));
        assert_eq!(rejected.broker_id, 2);
        assert_eq!(registry.len(), 1);
        assert!(rejected.shutdown(Duration::from_secs(1)).await);

        let kept = registry.remove(SubscriptionKind::PostCreated).unwrap();
        assert_eq!(kept.broker_id, 1);
        assert!(kept.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_finished_entry_frees_the_slot() {
        let mut registry = SubscriptionRegistry::default();
        let task = tokio::spawn(async {});
        let ended = ActiveSubscription::new(1, DeliveryMode::Callback, CancellationToken::new(), task);
        registry.insert(SubscriptionKind::PostCreated, ended).unwrap();

        while !registry.active[&SubscriptionKind::PostCreated].is_finished() {
            tokio::task::yield_now().await;
        }

        assert!(!registry.contains(SubscriptionKind::PostCreated));
        let stale = registry.take_finished(SubscriptionKind::PostCreated).unwrap();
        assert_eq!(stale.broker_id, 1);
        assert_eq!(registry.len(), 0);

        registry.insert(SubscriptionKind::PostCreated, idle_subscription(2)).unwrap();
        assert!(registry.contains(SubscriptionKind::PostCreated));
        assert!(registry.take_finished(SubscriptionKind::PostCreated).is_none());

        let live = registry.remove(SubscriptionKind::PostCreated).unwrap();
        assert!(live.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_callback_survives_panicking_handler() {
        let metrics = Arc::new(EventMetrics::new().unwrap());
        let (intake_tx, intake_rx) = mpsc::channel(4);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let task = tokio::spawn(run_callback::<PostCreatedMessage, _>(
            intake_rx,
            move |message: PostCreatedMessage| {
                if message.id == "boom" {
                    panic!("handler failure");
                }
                let _ = seen_tx.send(message);
            },
            token.clone(),
            metrics.clone(),
        ));

        let bad = PostCreatedMessage::new("boom", "x", Utc::now());
        let good = PostCreatedMessage::new("2", "fine", Utc::now());
        intake_tx.send(encode_message(&bad).unwrap()).await.unwrap();
        intake_tx.send(encode_message(&good).unwrap()).await.unwrap();

        let received = timeout(Duration::from_secs(1), seen_rx.recv()).await.unwrap();
        assert_eq!(received, Some(good));
        assert_eq!(metrics.handler_panics(PostCreatedMessage::topic()), 1);
        assert!(!task.is_finished());

        token.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_task() {
        let token = CancellationToken::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let subscription = ActiveSubscription::new(1, DeliveryMode::Callback, token, task);

        assert!(!subscription.shutdown(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_relay_skips_bad_payloads() {
        let metrics = Arc::new(EventMetrics::new().unwrap());
        let (intake_tx, intake_rx) = mpsc::channel(4);
        let (output_tx, output_rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let task = tokio::spawn(run_relay::<PostCreatedMessage>(
            intake_rx,
            output_tx,
            token.clone(),
            metrics.clone(),
        ));

        let good = PostCreatedMessage::new("1", "ok", Utc::now());
        intake_tx.send(b"junk".to_vec()).await.unwrap();
        intake_tx.send(encode_message(&good).unwrap()).await.unwrap();

        let mut stream = MessageStream::new(output_rx);
        let received = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert_eq!(received, Some(good));
        assert_eq!(metrics.decode_failures(PostCreatedMessage::topic()), 1);

        token.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_relay_stops_when_intake_closes() {
        let metrics = Arc::new(EventMetrics::new().unwrap());
        let (intake_tx, intake_rx) = mpsc::channel::<Vec<u8>>(4);
        let (output_tx, mut output_rx) = mpsc::channel::<PostCreatedMessage>(4);

        let task = tokio::spawn(run_relay(intake_rx, output_tx, CancellationToken::new(), metrics));
        drop(intake_tx);

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(output_rx.recv().await.is_none());
    }
}
