use std::time::Duration;

use board_events::{EventStore, EventStoreConfig, Post};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional .env with BOARD_EVENTS_* overrides
    dotenvy::dotenv().ok();

    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,board_events=debug"))
        )
        .init();

    let config = EventStoreConfig::from_env();
    tracing::info!(broker_url = %config.broker_url, "Starting board events demo");

    let store = EventStore::connect(config).await?;
    let mut posts = store.subscribe_post_created().await?;

    for body in ["Welcome to the board", "Second post"] {
        let post = Post::new(uuid::Uuid::new_v4().to_string(), body);
        store.publish_post_created(&post).await?;
        tracing::info!(post_id = %post.id, "Published post created event");
    }

    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(5), posts.recv()).await {
            Ok(Some(message)) => tracing::info!(
                post_id = %message.id,
                body = %message.body,
                created_at = %message.created_at,
                "Received post created event"
            ),
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("Timed out waiting for post created event");
                break;
            }
        }
    }

    store.close().await;
    tracing::info!("Demo complete");

    Ok(())
}
