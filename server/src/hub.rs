//! Wiring of one instance: dispatch loop, optional batcher, deduplicator
//! and relay consumers, all scoped to a single cancellation token.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::stream::BoxStream;
use futures_util::{Sink, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lookup::MembershipLookup;
use crate::notify::batcher::NotificationBatcher;
use crate::notify::dedup::MessageDeduplicator;
use crate::notify::service::{DispatchError, NotificationService};
use crate::relay::{BusError, MessageBus, PublishError, Relay, RelayEnvelope};
use crate::ws::{
    ConnectionId, ConnectionOptions, ConnectionRegistry, InboundHandler, Notification, TopicId,
    UserId,
};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to subscribe to the relay bus: {0}")]
    Subscribe(#[from] BusError),
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("relay publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub flush_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub instance_id: String,
    pub connection: ConnectionOptions,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    /// `None` delivers every notification immediately.
    pub batching: Option<BatchSettings>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            connection: ConnectionOptions::default(),
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(300),
            batching: None,
        }
    }
}

pub struct Hub {
    relay: Relay,
    service: NotificationService,
    dedup: Arc<MessageDeduplicator>,
    membership: Arc<dyn MembershipLookup>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Stopped last, after the batcher has handed over what it held.
    dispatch_cancel: CancellationToken,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Subscribe to the bus, then start every background task. A failed
    /// subscription is the only fatal startup condition.
    pub async fn start(
        settings: HubSettings,
        bus: Arc<dyn MessageBus>,
        membership: Arc<dyn MembershipLookup>,
        inbound: Arc<dyn InboundHandler>,
    ) -> Result<Self, StartupError> {
        let relay = Relay::new(bus, settings.instance_id.clone());
        let notifications = relay.subscribe_notifications().await?;
        let invalidations = relay.subscribe_membership_invalidations().await?;
        let removals = relay.subscribe_topic_removals().await?;

        let cancel = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        let (batcher, flusher) = match &settings.batching {
            Some(b) => {
                let (batcher, flusher) = NotificationBatcher::new(b.max_batch_size, b.flush_timeout);
                (Some(batcher), Some(flusher))
            }
            None => (None, None),
        };

        let (service, dispatch) =
            NotificationService::new(registry, settings.connection.clone(), inbound, batcher);
        let dispatch_cancel = CancellationToken::new();
        let dispatch_task = tokio::spawn(dispatch.run(dispatch_cancel.clone()));

        if let Some(flusher) = flusher {
            let flush_service = service.clone();
            tasks.push(tokio::spawn(flusher.run(
                move |key, notifications| {
                    if flush_service.deliver_batch(key, notifications).is_err() {
                        tracing::debug!(user_id = %key.user_id, "Dispatch loop gone, batch dropped");
                    }
                },
                cancel.clone(),
            )));
        }

        let dedup = Arc::new(MessageDeduplicator::new(
            settings.dedup_capacity,
            settings.dedup_ttl,
        ));
        tasks.push(tokio::spawn(dedup.clone().run_sweeper(cancel.clone())));

        tasks.push(tokio::spawn(consume_notifications(
            notifications,
            dedup.clone(),
            service.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(consume_invalidations(
            invalidations,
            membership.clone(),
            service.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(consume_removals(
            removals,
            service.clone(),
            cancel.clone(),
        )));

        tracing::info!(
            instance_id = %settings.instance_id,
            batching = settings.batching.is_some(),
            "Hub started"
        );

        Ok(Self {
            relay,
            service,
            dedup,
            membership,
            cancel,
            tasks: Mutex::new(tasks),
            dispatch_cancel,
            dispatch_task: Mutex::new(Some(dispatch_task)),
        })
    }

    pub fn instance_id(&self) -> &str {
        self.relay.instance_id()
    }

    pub fn service(&self) -> &NotificationService {
        &self.service
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.service.registry()
    }

    pub fn connection_count(&self) -> usize {
        self.registry().connection_count()
    }

    /// A token cancelled by [`Hub::shutdown`], for tasks that live as long
    /// as the hub.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Attach an authenticated socket, subscribed to the user's current topics.
    pub async fn register_connection<S, E>(
        &self,
        socket: S,
        user_id: UserId,
    ) -> Result<ConnectionId, DispatchError>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let topics = match self.membership.topics_for_user(user_id).await {
            Ok(topics) => topics,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Membership lookup failed, connecting without topics");
                Vec::new()
            }
        };
        self.service.register_connection(socket, user_id, topics).await
    }

    /// Deliver to this instance's subscribers of `topic_id` and relay to the others.
    pub async fn broadcast(
        &self,
        topic_id: TopicId,
        notification: Notification,
    ) -> Result<(), BroadcastError> {
        self.relay_and_deliver(self.relay.envelope(Some(topic_id), notification))
            .await
    }

    /// Deliver to every connection of `user_id` on every instance.
    pub async fn send_to_user(
        &self,
        user_id: UserId,
        notification: Notification,
    ) -> Result<(), BroadcastError> {
        self.relay_and_deliver(self.relay.envelope(None, notification.for_user(user_id)))
            .await
    }

    /// Local delivery happens first; the id is marked so our own echo from
    /// the bus is suppressed.
    async fn relay_and_deliver(&self, envelope: RelayEnvelope) -> Result<(), BroadcastError> {
        self.dedup.mark_delivered(&envelope.message_id);
        self.service
            .deliver(envelope.topic_id, Arc::new(envelope.notification.clone()))?;
        self.relay.publish_envelope(&envelope).await?;
        Ok(())
    }

    /// Tell every instance to re-read `user_id`'s topics. When the bus is
    /// down the local registry is still reconciled and the error returned.
    pub async fn invalidate_membership(&self, user_id: UserId) -> Result<(), PublishError> {
        if let Err(e) = self.relay.publish_membership_invalidated(user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Invalidation not relayed, applying locally");
            reconcile(self.membership.as_ref(), &self.service, user_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Drop `topic_id` from every instance's registry.
    pub async fn remove_topic(&self, topic_id: TopicId) -> Result<(), PublishError> {
        if let Err(e) = self.relay.publish_topic_removed(topic_id).await {
            tracing::warn!(topic_id = %topic_id, error = %e, "Topic removal not relayed, applying locally");
            if self.service.remove_topic(topic_id).is_err() {
                tracing::debug!(topic_id = %topic_id, "Dispatch loop gone, topic removal not applied");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Cancel every background task and wait for them to finish. Open
    /// connections are left to their own close path.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Hub task ended abnormally");
            }
        }

        self.dispatch_cancel.cancel();
        let dispatch = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = dispatch {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        tracing::info!("Hub stopped");
    }
}

async fn reconcile(membership: &dyn MembershipLookup, service: &NotificationService, user_id: UserId) {
    match membership.topics_for_user(user_id).await {
        Ok(topics) => {
            if service.apply_membership(user_id, topics).is_err() {
                tracing::debug!(user_id = %user_id, "Dispatch loop gone, membership not applied");
            }
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Membership lookup failed during invalidation");
        }
    }
}

async fn consume_notifications(
    mut stream: BoxStream<'static, RelayEnvelope>,
    dedup: Arc<MessageDeduplicator>,
    service: NotificationService,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(envelope) => envelope,
                None => {
                    tracing::warn!("Relay notification stream ended");
                    break;
                }
            },
        };

        if dedup.already_delivered(&envelope.message_id) {
            tracing::trace!(message_id = %envelope.message_id, "Duplicate relay notification suppressed");
            continue;
        }
        dedup.mark_delivered(&envelope.message_id);

        if service
            .deliver(envelope.topic_id, Arc::new(envelope.notification))
            .is_err()
        {
            break;
        }
    }
}

async fn consume_invalidations(
    mut stream: BoxStream<'static, UserId>,
    membership: Arc<dyn MembershipLookup>,
    service: NotificationService,
    cancel: CancellationToken,
) {
    loop {
        let user_id = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(user_id) => user_id,
                None => {
                    tracing::warn!("Relay invalidation stream ended");
                    break;
                }
            },
        };
        reconcile(membership.as_ref(), &service, user_id).await;
    }
}

async fn consume_removals(
    mut stream: BoxStream<'static, TopicId>,
    service: NotificationService,
    cancel: CancellationToken,
) {
    loop {
        let topic_id = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(topic_id) => topic_id,
                None => {
                    tracing::warn!("Relay topic removal stream ended");
                    break;
                }
            },
        };
        if service.remove_topic(topic_id).is_err() {
            break;
        }
    }
}
