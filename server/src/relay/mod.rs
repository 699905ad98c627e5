//! Cross-instance relay over a shared [`MessageBus`].
//!
//! Two logical streams: notifications on [`NOTIFICATION_CHANNEL`] and
//! membership changes on [`MEMBERSHIP_CHANNEL`]. Every publication carries a
//! fresh message id and the publishing instance's id. Instances receive
//! their own publications back; callers deduplicate by message id.

mod backoff;
pub mod bus;
pub mod redis_bus;

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ws::{Notification, TopicId, UserId};
use backoff::ExponentialBackoff;
pub use bus::{BusError, MemoryBus, MessageBus};
pub use redis_bus::RedisBus;

pub const NOTIFICATION_CHANNEL: &str = "chat";
pub const MEMBERSHIP_CHANNEL: &str = "subscriptions";

const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode relay payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A notification in transit between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub message_id: String,
    pub origin: String,
    /// Topic to fan out to; absent for user-addressed notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<TopicId>,
    pub notification: Notification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MembershipAction {
    /// Re-read the user's topics and reconcile open connections.
    Invalidate { user_id: UserId },
    /// Forget the topic everywhere.
    DeleteTopic { topic_id: TopicId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub message_id: String,
    pub origin: String,
    #[serde(flatten)]
    pub action: MembershipAction,
}

#[derive(Clone)]
pub struct Relay {
    bus: Arc<dyn MessageBus>,
    instance_id: String,
}

impl Relay {
    pub fn new(bus: Arc<dyn MessageBus>, instance_id: impl Into<String>) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Wrap a notification with a fresh message id and this instance's id.
    pub fn envelope(&self, topic_id: Option<TopicId>, notification: Notification) -> RelayEnvelope {
        RelayEnvelope {
            message_id: Uuid::new_v4().to_string(),
            origin: self.instance_id.clone(),
            topic_id,
            notification,
        }
    }

    pub async fn publish_envelope(&self, envelope: &RelayEnvelope) -> Result<(), PublishError> {
        let payload = serde_json::to_string(envelope)?;
        self.bus.publish(NOTIFICATION_CHANNEL, payload).await?;
        Ok(())
    }

    /// Publish a notification; returns the message id it was tagged with.
    pub async fn publish_notification(
        &self,
        topic_id: Option<TopicId>,
        notification: Notification,
    ) -> Result<String, PublishError> {
        let envelope = self.envelope(topic_id, notification);
        self.publish_envelope(&envelope).await?;
        Ok(envelope.message_id)
    }

    async fn publish_membership(&self, action: MembershipAction) -> Result<(), PublishError> {
        let event = MembershipEvent {
            message_id: Uuid::new_v4().to_string(),
            origin: self.instance_id.clone(),
            action,
        };
        let payload = serde_json::to_string(&event)?;
        self.bus.publish(MEMBERSHIP_CHANNEL, payload).await?;
        Ok(())
    }

    pub async fn publish_membership_invalidated(&self, user_id: UserId) -> Result<(), PublishError> {
        self.publish_membership(MembershipAction::Invalidate { user_id })
            .await
    }

    pub async fn publish_topic_removed(&self, topic_id: TopicId) -> Result<(), PublishError> {
        self.publish_membership(MembershipAction::DeleteTopic { topic_id })
            .await
    }

    /// Subscribe to `channel` for as long as the returned stream is held.
    /// Only the first subscription can fail; when the underlying stream ends
    /// later it is re-established with backoff, so the result never ends on
    /// its own. Publications made while resubscribing are not seen.
    async fn subscribe_channel(
        &self,
        channel: &'static str,
    ) -> Result<BoxStream<'static, String>, BusError> {
        let first = self.bus.subscribe(channel).await?;
        let state = ResubscribeState {
            bus: self.bus.clone(),
            channel,
            current: Some(first),
            backoff: ExponentialBackoff::new(RESUBSCRIBE_INITIAL_DELAY, RESUBSCRIBE_MAX_DELAY),
        };
        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(current) = state.current.as_mut() {
                    if let Some(payload) = current.next().await {
                        return Some((payload, state));
                    }
                    state.current = None;
                    state.backoff.reset();
                    tracing::warn!(channel = state.channel, "Bus subscription ended, resubscribing");
                }

                tokio::time::sleep(state.backoff.next_delay()).await;
                match state.bus.subscribe(state.channel).await {
                    Ok(resumed) => {
                        tracing::info!(channel = state.channel, "Bus subscription restored");
                        state.current = Some(resumed);
                    }
                    Err(e) => {
                        tracing::warn!(channel = state.channel, error = %e, "Resubscribe failed");
                    }
                }
            }
        })
        .boxed())
    }

    pub async fn subscribe_notifications(
        &self,
    ) -> Result<BoxStream<'static, RelayEnvelope>, BusError> {
        let raw = self.subscribe_channel(NOTIFICATION_CHANNEL).await?;
        Ok(raw
            .filter_map(|payload| async move {
                match serde_json::from_str::<RelayEnvelope>(&payload) {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable relay notification");
                        None
                    }
                }
            })
            .boxed())
    }

    async fn subscribe_membership(&self) -> Result<BoxStream<'static, MembershipEvent>, BusError> {
        let raw = self.subscribe_channel(MEMBERSHIP_CHANNEL).await?;
        Ok(raw
            .filter_map(|payload| async move {
                match serde_json::from_str::<MembershipEvent>(&payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable membership event");
                        None
                    }
                }
            })
            .boxed())
    }

    /// Users whose topic memberships changed.
    pub async fn subscribe_membership_invalidations(
        &self,
    ) -> Result<BoxStream<'static, UserId>, BusError> {
        Ok(self
            .subscribe_membership()
            .await?
            .filter_map(|event| async move {
                match event.action {
                    MembershipAction::Invalidate { user_id } => Some(user_id),
                    MembershipAction::DeleteTopic { .. } => None,
                }
            })
            .boxed())
    }

    /// Topics deleted anywhere in the cluster.
    pub async fn subscribe_topic_removals(&self) -> Result<BoxStream<'static, TopicId>, BusError> {
        Ok(self
            .subscribe_membership()
            .await?
            .filter_map(|event| async move {
                match event.action {
                    MembershipAction::DeleteTopic { topic_id } => Some(topic_id),
                    MembershipAction::Invalidate { .. } => None,
                }
            })
            .boxed())
    }
}

struct ResubscribeState {
    bus: Arc<dyn MessageBus>,
    channel: &'static str,
    current: Option<BoxStream<'static, String>>,
    backoff: ExponentialBackoff,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relay(bus: &Arc<MemoryBus>, instance: &str) -> Relay {
        Relay::new(bus.clone() as Arc<dyn MessageBus>, instance)
    }

    #[test]
    fn test_membership_event_wire_shape() {
        let user = Uuid::new_v4();
        let event = MembershipEvent {
            message_id: "m".into(),
            origin: "a".into(),
            action: MembershipAction::Invalidate { user_id: user },
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "invalidate");
        assert_eq!(value["user_id"], user.to_string());

        let delete: MembershipEvent = serde_json::from_value(json!({
            "message_id": "x", "origin": "b", "action": "delete_topic", "topic_id": user,
        }))
        .unwrap();
        assert_eq!(delete.action, MembershipAction::DeleteTopic { topic_id: user });
    }

    #[tokio::test]
    async fn test_publications_are_tagged_and_echoed() {
        let bus = Arc::new(MemoryBus::new());
        let a = relay(&bus, "instance-a");
        let mut echoes = a.subscribe_notifications().await.unwrap();

        let topic = Uuid::new_v4();
        let id = a
            .publish_notification(Some(topic), Notification::new("message", json!({"n": 1})))
            .await
            .unwrap();

        let received = echoes.next().await.unwrap();
        assert_eq!(received.message_id, id);
        assert_eq!(received.origin, "instance-a");
        assert_eq!(received.topic_id, Some(topic));
        assert_eq!(received.notification.kind, "message");
    }

    #[tokio::test]
    async fn test_membership_streams_split_by_action() {
        let bus = Arc::new(MemoryBus::new());
        let r = relay(&bus, "a");
        let mut invalidations = r.subscribe_membership_invalidations().await.unwrap();
        let mut removals = r.subscribe_topic_removals().await.unwrap();

        let (user, topic) = (Uuid::new_v4(), Uuid::new_v4());
        r.publish_topic_removed(topic).await.unwrap();
        r.publish_membership_invalidated(user).await.unwrap();

        assert_eq!(invalidations.next().await, Some(user));
        assert_eq!(removals.next().await, Some(topic));
    }

    #[tokio::test]
    async fn test_garbage_on_the_bus_is_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let r = relay(&bus, "a");
        let mut notifications = r.subscribe_notifications().await.unwrap();

        bus.publish(NOTIFICATION_CHANNEL, "{not json".into()).await.unwrap();
        let id = r
            .publish_notification(None, Notification::new("ping", json!(null)))
            .await
            .unwrap();
        assert_eq!(notifications.next().await.unwrap().message_id, id);
    }

    /// Hands out a first subscription that ends after one publication.
    struct DroppingBus {
        inner: MemoryBus,
        subscribes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageBus for DroppingBus {
        async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
            let n = self
                .subscribes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let raw = self.inner.subscribe(channel).await?;
            Ok(if n == 0 { raw.take(1).boxed() } else { raw })
        }
    }

    #[tokio::test]
    async fn test_subscription_survives_stream_end() {
        let bus = Arc::new(DroppingBus {
            inner: MemoryBus::new(),
            subscribes: Default::default(),
        });
        let r = Relay::new(bus.clone() as Arc<dyn MessageBus>, "a");
        let mut notifications = r.subscribe_notifications().await.unwrap();

        let first = r
            .publish_notification(None, Notification::new("n", json!(1)))
            .await
            .unwrap();
        assert_eq!(notifications.next().await.unwrap().message_id, first);

        let pending = tokio::spawn(async move { notifications.next().await });
        for _ in 0..200 {
            if bus.subscribes.load(std::sync::atomic::Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.subscribes.load(std::sync::atomic::Ordering::SeqCst), 2);

        let second = r
            .publish_notification(None, Notification::new("n", json!(2)))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.message_id, second);
    }
}
