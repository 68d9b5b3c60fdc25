use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::subscription::{
    run_callback, run_relay, ActiveSubscription, DeliveryMode, MessageStream, SubscriptionRegistry,
};
use crate::config::EventStoreConfig;
use crate::events::core::{encode_message, EventError, EventMessage, PostCreatedMessage, SubscriptionKind};
use crate::messaging::{self, Broker, BrokerSubscription};
use crate::metrics::EventMetrics;
use crate::models::Post;

// ============================================================================
// Event Store - Publish/Subscribe for Post Events
// ============================================================================
//
// Responsibilities:
// 1. Own the broker connection
// 2. Encode messages and publish them on their topic
// 3. Deliver inbound messages to a callback or to a stream
// 4. Tear everything down exactly once on close
//
// At most one subscription per kind is active. Subscribing again while one
// is active fails with `AlreadySubscribed`; call the matching unsubscribe
// first to replace it.
//
// ============================================================================

pub type PostCreatedStream = MessageStream<PostCreatedMessage>;

pub struct EventStore {
    broker: Arc<dyn Broker>,
    config: EventStoreConfig,
    subscriptions: Mutex<SubscriptionRegistry>,
    metrics: Arc<EventMetrics>,
    closed: AtomicBool,
}

impl EventStore {
    /// Connect to the broker named by `config.broker_url`
    pub async fn connect(config: EventStoreConfig) -> Result<Self, EventError> {
        let broker = messaging::connect(&config.broker_url).await.map_err(|e| {
            tracing::error!(error = %e, url = %config.broker_url, "Failed to connect to broker");
            EventError::Connection(e)
        })?;

        Self::with_broker(broker, config)
    }

    /// Wrap an already connected broker
    pub fn with_broker(broker: Arc<dyn Broker>, config: EventStoreConfig) -> Result<Self, EventError> {
        Ok(Self {
            broker,
            config,
            subscriptions: Mutex::new(SubscriptionRegistry::default()),
            metrics: Arc::new(EventMetrics::new()?),
            closed: AtomicBool::new(false),
        })
    }

    pub fn metrics(&self) -> &EventMetrics {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Announce a new post. Fire-and-forget: succeeds once the broker has
    /// accepted the payload, whether or not anyone is listening.
    pub async fn publish_post_created(&self, post: &Post) -> Result<(), EventError> {
        self.publish(&PostCreatedMessage::from(post)).await
    }

    /// Call `handler` for every post-created message, on a background task.
    ///
    /// The handler runs inline on that task, one message at a time, so it
    /// should return quickly. Blocking work belongs in `spawn_blocking` or
    /// behind a channel; on a current-thread runtime a blocking handler
    /// stalls the whole runtime. A panic in the handler is logged and
    /// counted, and delivery continues with the next message.
    pub async fn on_post_created<F>(&self, handler: F) -> Result<(), EventError>
    where
        F: FnMut(PostCreatedMessage) + Send + 'static,
    {
        self.subscribe_callback::<PostCreatedMessage, F>(SubscriptionKind::PostCreated, handler)
            .await
    }

    /// Receive post-created messages as a stream
    pub async fn subscribe_post_created(&self) -> Result<PostCreatedStream, EventError> {
        self.subscribe_stream::<PostCreatedMessage>(SubscriptionKind::PostCreated)
            .await
    }

    /// Remove the post-created subscription, waiting for its delivery task
    /// (and any handler call in progress) to finish.
    /// Returns whether there was one.
    pub async fn unsubscribe_post_created(&self) -> Result<bool, EventError> {
        self.unsubscribe(SubscriptionKind::PostCreated).await
    }

    /// Stop every subscription, then close the broker connection.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Event store already closed");
            return;
        }

        let drained = {
            let mut registry = self.subscriptions.lock().await;
            tracing::debug!(active = registry.len(), "Closing event store");
            registry.drain()
        };
        for (kind, subscription) in drained {
            self.release(kind, subscription).await;
        }

        self.broker.close().await;
        tracing::info!("Event store closed");
    }

    async fn publish<M: EventMessage>(&self, message: &M) -> Result<(), EventError> {
        if self.is_closed() {
            return Err(EventError::Closed);
        }

        let topic = M::topic();
        let payload = encode_message(message).inspect_err(|e| {
            self.metrics.record_publish_failed(topic);
            tracing::error!(error = %e, topic = %topic, "Failed to encode message");
        })?;

        match self.broker.publish(topic, payload).await {
            Ok(()) => {
                self.metrics.record_published(topic);
                tracing::debug!(topic = %topic, "Published message");
                Ok(())
            }
            Err(source) => {
                self.metrics.record_publish_failed(topic);
                tracing::error!(error = %source, topic = %topic, "Failed to publish message");
                Err(EventError::Publish { topic, source })
            }
        }
    }

    async fn subscribe_callback<M, F>(&self, kind: SubscriptionKind, handler: F) -> Result<(), EventError>
    where
        M: EventMessage,
        F: FnMut(M) + Send + 'static,
    {
        let mut registry = self.open_registry(kind).await?;
        let subscription = self.register::<M>().await?;
        let broker_id = subscription.id;

        let token = CancellationToken::new();
        let task = tokio::spawn(run_callback::<M, F>(
            subscription.messages,
            handler,
            token.clone(),
            self.metrics.clone(),
        ));

        self.track(
            &mut registry,
            kind,
            ActiveSubscription::new(broker_id, DeliveryMode::Callback, token, task),
        )
        .await
    }

    async fn subscribe_stream<M: EventMessage>(&self, kind: SubscriptionKind) -> Result<MessageStream<M>, EventError> {
        let mut registry = self.open_registry(kind).await?;
        let subscription = self.register::<M>().await?;
        let broker_id = subscription.id;

        let (output_tx, output_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let token = CancellationToken::new();
        let task = tokio::spawn(run_relay::<M>(
            subscription.messages,
            output_tx,
            token.clone(),
            self.metrics.clone(),
        ));

        self.track(
            &mut registry,
            kind,
            ActiveSubscription::new(broker_id, DeliveryMode::Stream, token, task),
        )
        .await?;

        Ok(MessageStream::new(output_rx))
    }

    async fn unsubscribe(&self, kind: SubscriptionKind) -> Result<bool, EventError> {
        let removed = self.subscriptions.lock().await.remove(kind);

        match removed {
            Some(subscription) => {
                self.release(kind, subscription).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Lock the registry, refusing if the store is closed or `kind` is taken.
    /// An entry whose task already ended (its intake closed under it) is
    /// released first and does not count as taken.
    /// The guard is held through registration so concurrent subscribes
    /// cannot both pass the check.
    async fn open_registry(&self, kind: SubscriptionKind) -> Result<MutexGuard<'_, SubscriptionRegistry>, EventError> {
        let mut registry = self.subscriptions.lock().await;

        if self.is_closed() {
            return Err(EventError::Closed);
        }
        if let Some(stale) = registry.take_finished(kind) {
            tracing::warn!(kind = ?kind, mode = ?stale.mode, "Reclaiming subscription whose delivery task ended");
            self.release(kind, stale).await;
        }
        if registry.contains(kind) {
            tracing::warn!(kind = ?kind, "Subscription already active");
            return Err(EventError::AlreadySubscribed(kind));
        }

        Ok(registry)
    }

    async fn register<M: EventMessage>(&self) -> Result<BrokerSubscription, EventError> {
        let topic = M::topic();

        self.broker
            .subscribe(topic, self.config.channel_capacity)
            .await
            .map_err(|source| {
                tracing::error!(error = %source, topic = %topic, "Failed to subscribe");
                EventError::Subscribe { topic, source }
            })
    }

    async fn track(
        &self,
        registry: &mut SubscriptionRegistry,
        kind: SubscriptionKind,
        subscription: ActiveSubscription,
    ) -> Result<(), EventError> {
        let mode = subscription.mode;

        if let Err((e, rejected)) = registry.insert(kind, subscription) {
            self.stop(kind, rejected).await;
            return Err(e);
        }

        self.metrics.active_subscriptions.inc();
        tracing::info!(kind = ?kind, mode = ?mode, "Subscription registered");
        Ok(())
    }

    async fn release(&self, kind: SubscriptionKind, subscription: ActiveSubscription) {
        let mode = subscription.mode;

        self.stop(kind, subscription).await;

        self.metrics.active_subscriptions.dec();
        tracing::info!(kind = ?kind, mode = ?mode, "Subscription removed");
    }

    /// Stop the delivery task first, then drop the broker registration
    async fn stop(&self, kind: SubscriptionKind, subscription: ActiveSubscription) {
        let broker_id = subscription.broker_id;

        subscription.shutdown(self.config.shutdown_timeout).await;

        if let Err(e) = self.broker.unsubscribe(broker_id).await {
            tracing::warn!(error = %e, kind = ?kind, "Broker unsubscribe failed");
        }
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        if !self.is_closed() {
            // No async teardown here; stop the tasks and let the broker
            // connection go with its last reference
            self.subscriptions.get_mut().cancel_all();
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
