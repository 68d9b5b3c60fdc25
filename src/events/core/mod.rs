// ============================================================================
// Event Core - Messages, Codec, Errors
// ============================================================================

pub mod errors;
pub mod message;

pub use errors::{EventError, SubscriptionKind};
pub use message::{
    decode_message, encode_message, EventMessage, PostCreatedMessage, POST_CREATED_TOPIC,
};
