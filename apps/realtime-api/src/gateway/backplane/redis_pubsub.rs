//! Redis pub/sub backplane: one Redis channel per event category.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::gateway::events::Category;

use super::{Backplane, Envelope};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const LOCAL_FEED_CAPACITY: usize = 4096;

pub struct RedisBackplane {
    client: redis::Client,
    publisher: ConnectionManager,
    /// Inbound feed, filled by the listener task.
    feed: broadcast::Sender<Envelope>,
    connected: Arc<AtomicBool>,
    max_backoff: Duration,
}

impl RedisBackplane {
    /// Open the publishing connection. The inbound side starts with
    /// [`RedisBackplane::spawn_listener`].
    pub async fn connect(url: &str, max_backoff: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let (feed, _) = broadcast::channel(LOCAL_FEED_CAPACITY);
        tracing::info!("backplane publisher connected");
        Ok(Self {
            client,
            publisher,
            feed,
            connected: Arc::new(AtomicBool::new(false)),
            max_backoff: max_backoff.max(INITIAL_BACKOFF),
        })
    }

    /// Subscribe to every category channel and keep resubscribing with
    /// exponential backoff whenever the subscription drops.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        spawn_listener_task(
            self.client.clone(),
            self.feed.clone(),
            self.connected.clone(),
            self.max_backoff,
        )
    }
}

fn spawn_listener_task(
    client: redis::Client,
    feed: broadcast::Sender<Envelope>,
    connected: Arc<AtomicBool>,
    max_backoff: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match listen(&client, &feed, &connected).await {
                Ok(()) => {
                    tracing::warn!("backplane subscription ended, running in local-only mode");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    tracing::warn!(
                        ?e,
                        retry_in_secs = backoff.as_secs(),
                        "backplane subscribe failed, running in local-only mode"
                    );
                }
            }
            connected.store(false, Ordering::SeqCst);
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, max_backoff);
        }
    })
}

/// One subscription session. Returns when the server closes the stream.
async fn listen(
    client: &redis::Client,
    feed: &broadcast::Sender<Envelope>,
    connected: &AtomicBool,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    for category in Category::ALL {
        pubsub.subscribe(category.channel()).await?;
    }
    connected.store(true, Ordering::SeqCst);
    // Anything published while unsubscribed never reached this feed.
    let _ = feed.send(Envelope::resync("redis"));
    tracing::info!("backplane subscribed");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(?e, %channel, "unreadable backplane payload");
                continue;
            }
        };
        if let Some(envelope) = decode_envelope(&channel, &payload) {
            let _ = feed.send(envelope);
        }
    }
    Ok(())
}

fn decode_envelope(channel: &str, payload: &str) -> Option<Envelope> {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(?e, %channel, "malformed backplane envelope");
            None
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| GatewayError::BackplaneUnavailable(e.to_string()))?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(envelope.category.channel(), payload)
            .await
            .map_err(|e| GatewayError::BackplaneUnavailable(e.to_string()))
    }

    fn subscribe(&self) -> BoxStream<'static, Envelope> {
        super::feed(self.feed.subscribe(), "redis")
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
