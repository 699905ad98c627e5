//! Pub/sub transport underneath the relay. Every subscriber of a channel,
//! the publishing instance included, receives every publication.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream};
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("failed to subscribe to {channel}: {reason}")]
    Subscribe { channel: String, reason: String },
}

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscribe for the lifetime of the returned stream.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError>;
}

const MEMORY_BUS_CAPACITY: usize = 4096;

/// In-process bus. Instances sharing one `MemoryBus` behave like instances
/// sharing a Redis server.
#[derive(Debug, Default)]
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_BUS_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        // No subscribers is not an error, the publication is simply unobserved.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, channel))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "Bus subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
