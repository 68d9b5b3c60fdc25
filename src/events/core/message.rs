use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::EventError;
use crate::models::Post;

// ============================================================================
// Event Messages
// ============================================================================
//
// Every message kind owns one fixed topic key, derived from the type alone.
// Payloads are bincode: field order and types are the wire format, there is
// no version tag, so writer and reader must be built from the same struct.
//
// ============================================================================

pub const POST_CREATED_TOPIC: &str = "post.created";

/// A message kind that can travel through the event store
pub trait EventMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Topic the kind is published and subscribed on
    fn topic() -> &'static str;
}

/// Notification that a post was created
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PostCreatedMessage {
    pub id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl PostCreatedMessage {
    pub fn new(id: impl Into<String>, body: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            created_at,
        }
    }
}

impl From<&Post> for PostCreatedMessage {
    fn from(post: &Post) -> Self {
        Self::new(post.id.clone(), post.body.clone(), post.created_at)
    }
}

impl EventMessage for PostCreatedMessage {
    fn topic() -> &'static str {
        POST_CREATED_TOPIC
    }
}

pub fn encode_message<M: EventMessage>(message: &M) -> Result<Vec<u8>, EventError> {
    bincode::serialize(message).map_err(|source| EventError::Encode {
        topic: M::topic(),
        source,
    })
}

pub fn decode_message<M: EventMessage>(payload: &[u8]) -> Result<M, EventError> {
    bincode::deserialize(payload).map_err(|source| EventError::Decode {
        topic: M::topic(),
        source,
    })
}
