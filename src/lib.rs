//! Publish/subscribe event store for forum post notifications.
//!
//! ```no_run
//! use board_events::{EventStore, EventStoreConfig, Post};
//!
//! # async fn run() -> Result<(), board_events::EventError> {
//! let store = EventStore::connect(EventStoreConfig::from_env()).await?;
//! let mut posts = store.subscribe_post_created().await?;
//!
//! store.publish_post_created(&Post::new("42", "hello")).await?;
//! let received = posts.recv().await;
//!
//! store.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod events;
pub mod messaging;
pub mod metrics;
pub mod models;

pub use config::EventStoreConfig;
pub use events::{EventError, EventStore, PostCreatedMessage, PostCreatedStream, SubscriptionKind};
pub use models::Post;
