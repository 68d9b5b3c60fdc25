use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

mod memory;
mod redis_broker;

pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;

// ============================================================================
// Broker Transport
// ============================================================================
//
// The event store treats the broker as an opaque publish/subscribe pipe:
// raw bytes go out on a topic, raw bytes come back on a bounded queue.
// Everything typed (envelopes, decoding, delivery modes) lives above this.
//
// Supported endpoints:
// - redis://host:port   Redis PUBLISH / SUBSCRIBE
// - memory://<name>     In-process broker, isolated per connection
//
// ============================================================================

/// Identifier the broker hands out for each subscription it registers
pub type SubscriptionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Unsupported broker URL: {0}")]
    UnsupportedUrl(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker connection is closed")]
    Closed,
}

/// A live subscription on the broker side.
///
/// Raw payloads arrive on `messages` in the order the broker delivered them.
/// The queue closes when the subscription is removed or the broker closes.
#[derive(Debug)]
pub struct BrokerSubscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub messages: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to a topic. Fire-and-forget: no delivery ack.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Register interest in a topic. Inbound payloads are queued with the
    /// given capacity; a full queue blocks delivery for this subscriber.
    async fn subscribe(&self, topic: &str, capacity: usize) -> Result<BrokerSubscription, BrokerError>;

    /// Remove a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError>;

    /// Tear down the connection and every subscription on it.
    async fn close(&self);
}

/// Open a broker connection for the given endpoint URL
pub async fn connect(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    if url.starts_with("redis://") {
        let broker = RedisBroker::connect(url).await?;
        Ok(Arc::new(broker))
    } else if url.starts_with("memory://") {
        tracing::debug!(url = %url, "Using in-process broker");
        Ok(Arc::new(InMemoryBroker::new()))
    } else {
        Err(BrokerError::UnsupportedUrl(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_url() {
        let broker = connect("memory://tests").await.unwrap();
        broker.publish("some.topic", vec![1, 2, 3]).await.unwrap();
        broker.close().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let result = connect("amqp://localhost:5672").await;
        assert!(matches!(result, Err(BrokerError::UnsupportedUrl(url)) if url == "amqp://localhost:5672"));
    }

    #[tokio::test]
    async fn test_connect_unreachable_redis_fails() {
        // Port 1 is never a Redis server
        let result = connect("redis://127.0.0.1:1").await;
        assert!(matches!(result, Err(BrokerError::Redis(_))));
    }
}
