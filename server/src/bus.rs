use anyhow::{Context, Result};
use futures_util::StreamExt;
use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Creates a ConnectionManager with standardized configuration for the
/// application. Used for publishing and KV operations; subscriptions get
/// their own dedicated pubsub connections.
pub async fn create_connection_manager(client: Client) -> Result<ConnectionManager> {
    ConnectionManager::new(client)
        .await
        .context("Failed to create Redis connection manager")
}

/// A message received from a subscription: (channel, payload).
pub type BusMessage = (String, Vec<u8>);

/// Subscribe to a fixed set of channels. Messages are forwarded into the
/// returned receiver by a background task that reconnects on bus errors and
/// stops once the receiver is dropped.
pub fn subscribe(redis_url: String, channels: Vec<String>) -> mpsc::Receiver<BusMessage> {
    let (tx, rx) = mpsc::channel(1000);
    tokio::spawn(async move {
        run_subscription(redis_url, channels, Vec::new(), tx).await;
    });
    rx
}

/// Subscribe to channel patterns (PSUBSCRIBE).
pub fn psubscribe(redis_url: String, patterns: Vec<String>) -> mpsc::Receiver<BusMessage> {
    let (tx, rx) = mpsc::channel(1000);
    tokio::spawn(async move {
        run_subscription(redis_url, Vec::new(), patterns, tx).await;
    });
    rx
}

async fn run_subscription(
    redis_url: String,
    channels: Vec<String>,
    patterns: Vec<String>,
    tx: mpsc::Sender<BusMessage>,
) {
    loop {
        match forward_messages(&redis_url, &channels, &patterns, &tx).await {
            Ok(()) => {
                // Receiver dropped; we're done.
                return;
            }
            Err(e) => {
                error!(error = %e, "Bus subscription failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        if tx.is_closed() {
            return;
        }
    }
}

async fn forward_messages(
    redis_url: &str,
    channels: &[String],
    patterns: &[String],
    tx: &mpsc::Sender<BusMessage>,
) -> Result<()> {
    let client = Client::open(redis_url).context("Failed to create Redis client for subscription")?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to create PubSub connection")?;

    for channel in channels {
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("Failed to subscribe to {channel}"))?;
    }
    for pattern in patterns {
        pubsub
            .psubscribe(pattern)
            .await
            .with_context(|| format!("Failed to psubscribe to {pattern}"))?;
    }

    info!(?channels, ?patterns, "Bus subscription established");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: Vec<u8> = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(channel, error = %e, "Failed to read bus payload");
                continue;
            }
        };
        if tx.send((channel, payload)).await.is_err() {
            warn!("Bus receiver dropped, stopping subscription");
            return Ok(());
        }
    }

    anyhow::bail!("pubsub stream ended")
}
