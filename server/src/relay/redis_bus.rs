use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::bus::{BusError, MessageBus};

const PUBLISH_MAX_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_DELAYS: &[Duration] = &[Duration::from_millis(100), Duration::from_millis(200)];

/// Redis pub/sub. Publishes share one multiplexed connection, re-established
/// lazily after a failure; each subscription holds its own pub/sub connection.
pub struct RedisBus {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    /// Open the client and verify the server is reachable.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        tracing::info!("Connected to Redis bus");
        Ok(Self {
            client,
            publisher: Mutex::new(Some(conn)),
        })
    }

    /// The cached connection, or a fresh one. The lock is never held across
    /// the connect.
    async fn publisher(&self) -> redis::RedisResult<MultiplexedConnection> {
        let cached = self.publisher.lock().await.clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        let mut slot = self.publisher.lock().await;
        // Another publisher may have reconnected meanwhile; keep the first.
        Ok(slot.get_or_insert(conn).clone())
    }

    async fn publish_once(&self, channel: &str, payload: &str) -> redis::RedisResult<()> {
        let mut conn = self.publisher().await?;
        let result = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await;
        if result.is_err() {
            self.publisher.lock().await.take();
        }
        result
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut last_err = String::new();
        for attempt in 0..PUBLISH_MAX_ATTEMPTS {
            match self.publish_once(channel, &payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(channel = %channel, attempt, error = %e, "Redis publish failed");
                    last_err = e.to_string();
                    if let Some(delay) = PUBLISH_RETRY_DELAYS.get(attempt) {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }
        Err(BusError::Unavailable(last_err))
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
        let subscribe_err = |e: redis::RedisError| BusError::Subscribe {
            channel: channel.to_string(),
            reason: e.to_string(),
        };
        let mut pubsub = self.client.get_async_pubsub().await.map_err(subscribe_err)?;
        pubsub.subscribe(channel).await.map_err(subscribe_err)?;
        tracing::info!(channel = %channel, "Subscribed to Redis channel");

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Dropping non-text Redis payload");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
