use crate::messaging::BrokerError;

// ============================================================================
// Event Store Errors
// ============================================================================

/// Kinds of subscription a store can hold, one of each at most
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    PostCreated,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Cannot connect to broker: {0}")]
    Connection(#[source] BrokerError),

    #[error("Failed to encode {topic} message: {source}")]
    Encode {
        topic: &'static str,
        #[source]
        source: bincode::Error,
    },

    #[error("Failed to publish to {topic}: {source}")]
    Publish {
        topic: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("Malformed {topic} payload: {source}")]
    Decode {
        topic: &'static str,
        #[source]
        source: bincode::Error,
    },

    #[error("A {0:?} subscription is already active")]
    AlreadySubscribed(SubscriptionKind),

    #[error("Event store is closed")]
    Closed,

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl EventError {
    /// True for failures on the publish path (encoding or broker rejection)
    pub fn is_publish_error(&self) -> bool {
        matches!(self, EventError::Encode { .. } | EventError::Publish { .. })
    }
}
