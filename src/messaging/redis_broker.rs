use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Broker, BrokerError, BrokerSubscription, SubscriptionId};

// ============================================================================
// Redis Pub/Sub Broker
// ============================================================================
//
// - Publishing goes through one shared multiplexed connection.
// - Each subscription opens its own PubSub connection and a forwarder task
//   that copies message payloads into the subscriber's bounded queue.
// - Cancelling a forwarder drops its PubSub connection, which is how Redis
//   learns about the unsubscribe. A forwarder also stops once its receiver
//   is gone, and dropping the broker cancels every forwarder.
//
// ============================================================================

pub struct RedisBroker {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    forwarders: StdMutex<HashMap<SubscriptionId, CancellationToken>>,
    next_id: AtomicU64,
}

impl RedisBroker {
    /// Connect to Redis. Fails if the server is unreachable or rejects us.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        tracing::info!(url = %url, "Connected to Redis broker");

        Ok(Self {
            client,
            connection: Mutex::new(Some(connection)),
            forwarders: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    async fn shared_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.connection.lock().await.clone().ok_or(BrokerError::Closed)
    }

    fn forwarders(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, CancellationToken>> {
        self.forwarders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        let forwarders = self.forwarders.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, token) in forwarders.drain() {
            token.cancel();
        }
    }
}

/// Copy payloads into `tx` until cancelled, the source ends, or the
/// receiving side is dropped.
async fn forward<S>(
    messages: S,
    tx: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
    topic: &str,
    id: SubscriptionId,
) where
    S: Stream<Item = Vec<u8>>,
{
    tokio::pin!(messages);

    loop {
        let payload = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tx.closed() => break,
            payload = messages.next() => payload,
        };

        let Some(payload) = payload else {
            tracing::warn!(topic = %topic, "Redis subscription stream ended");
            break;
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sent = tx.send(payload) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(topic = %topic, subscription_id = id, "Redis forwarder stopped");
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut connection = self.shared_connection().await?;

        let published: redis::RedisResult<i64> = connection.publish(topic, payload).await;
        match published {
            Ok(receivers) => {
                tracing::debug!(topic = %topic, receivers = receivers, "Published to Redis");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, topic = %topic, "Failed to publish to Redis");
                Err(e.into())
            }
        }
    }

    async fn subscribe(&self, topic: &str, capacity: usize) -> Result<BrokerSubscription, BrokerError> {
        // Refuse once closed, even though PubSub uses its own connection
        self.shared_connection().await?;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = CancellationToken::new();
        self.forwarders().insert(id, token.clone());

        let topic_name = topic.to_string();
        tokio::spawn(async move {
            let messages = pubsub
                .into_on_message()
                .map(|msg| msg.get_payload_bytes().to_vec());
            forward(messages, tx, token, &topic_name, id).await;
        });

        tracing::info!(topic = %topic, subscription_id = id, "Subscribed to Redis topic");

        Ok(BrokerSubscription {
            id,
            topic: topic.to_string(),
            messages: rx,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        let removed = self.forwarders().remove(&id);
        if let Some(token) = removed {
            token.cancel();
            tracing::debug!(subscription_id = id, "Unsubscribed from Redis topic");
        }
        Ok(())
    }

    async fn close(&self) {
        let connection = self.connection.lock().await.take();
        if connection.is_none() {
            return;
        }

        let forwarders: Vec<_> = self.forwarders().drain().collect();
        for (_, token) in forwarders {
            token.cancel();
        }

        tracing::info!("Redis broker connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_forwarder_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let task = tokio::spawn(forward(stream::pending::<Vec<u8>>(), tx, token.clone(), "post.created", 1));
        drop(rx);

        timeout(WAIT, task).await.expect("forwarder must not outlive its receiver").unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_forwarder_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let task = tokio::spawn(forward(stream::pending::<Vec<u8>>(), tx, token.clone(), "post.created", 2));
        token.cancel();

        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_copies_payloads_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let source = stream::iter(vec![b"one".to_vec(), b"two".to_vec()]);

        timeout(WAIT, forward(source, tx, CancellationToken::new(), "post.created", 3))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(b"one".to_vec()));
        assert_eq!(rx.recv().await, Some(b"two".to_vec()));
        assert_eq!(rx.recv().await, None);
    }
}
