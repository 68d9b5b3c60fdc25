use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, BrokerSubscription, SubscriptionId};

// ============================================================================
// In-Process Broker
// ============================================================================
//
// Fans each published payload out to every subscriber of the topic.
// Delivery awaits queue capacity, so a slow subscriber slows the publisher
// instead of losing messages. Subscribers whose queue was dropped are
// pruned on the next publish.
//
// ============================================================================

type Subscribers = Vec<(SubscriptionId, mpsc::Sender<Vec<u8>>)>;

pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Subscribers>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn subscribers(&self, topic: &str) -> Subscribers {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).cloned().unwrap_or_default()
    }

    fn prune(&self, topic: &str, stale: &[SubscriptionId]) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|(id, _)| !stale.contains(id));
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map(Vec::len).unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let subscribers = self.subscribers(topic);
        let mut stale = Vec::new();

        for (id, tx) in &subscribers {
            if tx.send(payload.clone()).await.is_err() {
                stale.push(*id);
            }
        }

        if !stale.is_empty() {
            tracing::debug!(topic = %topic, pruned = stale.len(), "Pruned dropped subscribers");
            self.prune(topic, &stale);
        }

        tracing::trace!(
            topic = %topic,
            receivers = subscribers.len() - stale.len(),
            "Published to in-process broker"
        );
        Ok(())
    }

    async fn subscribe(&self, topic: &str, capacity: usize) -> Result<BrokerSubscription, BrokerError> {
        self.ensure_open()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.entry(topic.to_string()).or_default().push((id, tx));

        Ok(BrokerSubscription {
            id,
            topic: topic.to_string(),
            messages: rx,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        for subscribers in topics.values_mut() {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders ends every subscriber queue
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::debug!("In-process broker closed");
    }
}
