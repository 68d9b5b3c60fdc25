// ============================================================================
// Event Store - Broker-backed publish/subscribe
// ============================================================================

pub mod event_store;
pub mod subscription;

pub use event_store::{EventStore, PostCreatedStream};
pub use subscription::{DeliveryMode, MessageStream};
