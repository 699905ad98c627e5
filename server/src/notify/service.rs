//! The per-instance dispatch loop.
//!
//! One task owns every registry mutation and every local fan-out. Other
//! components talk to it through [`NotificationService`], a cheap cloneable
//! handle over its input channels.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Sink, Stream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::batcher::{BatchKey, NotificationBatcher};
use crate::ws::actor::{self, ConnectionContext};
use crate::ws::{
    ConnectionHandle, ConnectionId, ConnectionOptions, ConnectionRegistry, InboundHandler,
    Notification, TopicId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch loop is not running")]
    Closed,
}

/// Work accepted by the dispatch loop besides registration and removal.
#[derive(Debug)]
pub enum Submission {
    /// Fan out to a topic, or to the hinted user's connections.
    Deliver {
        topic_id: Option<TopicId>,
        notification: Arc<Notification>,
    },
    /// A batch released by the batcher, delivered without re-batching.
    DeliverBatch {
        key: BatchKey,
        notifications: Vec<Arc<Notification>>,
    },
    /// Reconcile a user's connections against an authoritative topic list.
    ApplyMembership {
        user_id: UserId,
        topics: Vec<TopicId>,
    },
    JoinTopic {
        user_id: UserId,
        topic_id: TopicId,
    },
    LeaveTopic {
        user_id: UserId,
        topic_id: TopicId,
    },
    RemoveTopic {
        topic_id: TopicId,
    },
}

struct Registration {
    handle: Arc<ConnectionHandle>,
    topics: Vec<TopicId>,
    driver: BoxFuture<'static, ()>,
    reply: oneshot::Sender<ConnectionId>,
}

#[derive(Clone)]
pub struct NotificationService {
    submit_tx: mpsc::UnboundedSender<Submission>,
    register_tx: mpsc::UnboundedSender<Registration>,
    remove_tx: mpsc::UnboundedSender<ConnectionId>,
    registry: Arc<ConnectionRegistry>,
    options: ConnectionOptions,
    inbound: Arc<dyn InboundHandler>,
}

pub struct DispatchLoop {
    registry: Arc<ConnectionRegistry>,
    batcher: Option<NotificationBatcher>,
    submit_rx: mpsc::UnboundedReceiver<Submission>,
    register_rx: mpsc::UnboundedReceiver<Registration>,
    remove_rx: mpsc::UnboundedReceiver<ConnectionId>,
}

impl NotificationService {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        options: ConnectionOptions,
        inbound: Arc<dyn InboundHandler>,
        batcher: Option<NotificationBatcher>,
    ) -> (Self, DispatchLoop) {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let service = Self {
            submit_tx,
            register_tx,
            remove_tx,
            registry: registry.clone(),
            options,
            inbound,
        };
        let dispatch = DispatchLoop {
            registry,
            batcher,
            submit_rx,
            register_rx,
            remove_rx,
        };
        (service, dispatch)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Hand an upgraded socket to the dispatch loop. Resolves once the
    /// connection is in the registry, so traffic submitted afterwards reaches it.
    pub async fn register_connection<S, E>(
        &self,
        socket: S,
        user_id: UserId,
        topics: Vec<TopicId>,
    ) -> Result<ConnectionId, DispatchError>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (handle, outbound) = ConnectionHandle::new(user_id, &self.options);
        let ctx = ConnectionContext {
            handle: handle.clone(),
            outbound,
            options: self.options.clone(),
            inbound: self.inbound.clone(),
            remove_tx: self.remove_tx.clone(),
        };
        let (reply, registered) = oneshot::channel();
        self.register_tx
            .send(Registration {
                handle,
                topics,
                driver: actor::run_connection(socket, ctx).boxed(),
                reply,
            })
            .map_err(|_| DispatchError::Closed)?;
        registered.await.map_err(|_| DispatchError::Closed)
    }

    /// Ask the loop to drop a connection and close its queue.
    pub fn unregister(&self, connection_id: ConnectionId) -> Result<(), DispatchError> {
        self.remove_tx
            .send(connection_id)
            .map_err(|_| DispatchError::Closed)
    }

    pub fn submit(&self, submission: Submission) -> Result<(), DispatchError> {
        self.submit_tx
            .send(submission)
            .map_err(|_| DispatchError::Closed)
    }

    pub fn deliver(
        &self,
        topic_id: Option<TopicId>,
        notification: Arc<Notification>,
    ) -> Result<(), DispatchError> {
        self.submit(Submission::Deliver {
            topic_id,
            notification,
        })
    }

    pub fn deliver_batch(
        &self,
        key: BatchKey,
        notifications: Vec<Arc<Notification>>,
    ) -> Result<(), DispatchError> {
        self.submit(Submission::DeliverBatch { key, notifications })
    }

    pub fn apply_membership(&self, user_id: UserId, topics: Vec<TopicId>) -> Result<(), DispatchError> {
        self.submit(Submission::ApplyMembership { user_id, topics })
    }

    pub fn join_topic(&self, user_id: UserId, topic_id: TopicId) -> Result<(), DispatchError> {
        self.submit(Submission::JoinTopic { user_id, topic_id })
    }

    pub fn leave_topic(&self, user_id: UserId, topic_id: TopicId) -> Result<(), DispatchError> {
        self.submit(Submission::LeaveTopic { user_id, topic_id })
    }

    pub fn remove_topic(&self, topic_id: TopicId) -> Result<(), DispatchError> {
        self.submit(Submission::RemoveTopic { topic_id })
    }
}

impl DispatchLoop {
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(batching = self.batcher.is_some(), "Dispatch loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(registration) = self.register_rx.recv() => self.register(registration),
                Some(connection_id) = self.remove_rx.recv() => self.evict(connection_id),
                Some(submission) = self.submit_rx.recv() => self.handle(submission).await,
            }
        }

        // Deliver whatever was submitted before the stop, unbatched.
        self.batcher = None;
        while let Ok(submission) = self.submit_rx.try_recv() {
            self.handle(submission).await;
        }
        tracing::info!(
            connections = self.registry.connection_count(),
            "Dispatch loop stopped"
        );
    }

    fn register(&self, registration: Registration) {
        let Registration {
            handle,
            topics,
            driver,
            reply,
        } = registration;
        let connection_id = handle.id();
        self.registry.add_connection(handle, &topics);
        tokio::spawn(driver);
        let _ = reply.send(connection_id);
    }

    /// Drop a connection from the registry and close its queue. Safe to call
    /// for connections already gone.
    fn evict(&self, connection_id: ConnectionId) {
        if let Some(handle) = self.registry.remove_connection(connection_id) {
            handle.close();
        }
    }

    async fn handle(&self, submission: Submission) {
        match submission {
            Submission::Deliver {
                topic_id,
                notification,
            } => self.deliver(topic_id, notification).await,
            Submission::DeliverBatch { key, notifications } => {
                let targets = match key.topic_id {
                    Some(topic_id) => self
                        .registry
                        .connections_by_topic(topic_id)
                        .into_iter()
                        .filter(|conn| conn.user_id() == key.user_id)
                        .collect(),
                    None => self.registry.connections_by_user(key.user_id),
                };
                self.fan_out(targets, &notifications).await;
            }
            Submission::ApplyMembership { user_id, topics } => {
                self.registry.invalidate_membership(user_id, &topics);
            }
            Submission::JoinTopic { user_id, topic_id } => {
                self.registry.add_user_to_topic(user_id, topic_id);
            }
            Submission::LeaveTopic { user_id, topic_id } => {
                self.registry.remove_user_from_topic(user_id, topic_id);
            }
            Submission::RemoveTopic { topic_id } => {
                let dropped = self.registry.remove_topic(topic_id);
                tracing::debug!(topic_id = %topic_id, dropped, "Topic removed");
            }
        }
    }

    async fn deliver(&self, topic_id: Option<TopicId>, notification: Arc<Notification>) {
        let targets = match (notification.target_user, topic_id) {
            (Some(user_id), _) => self.registry.connections_by_user(user_id),
            (None, Some(topic_id)) => self.registry.connections_by_topic(topic_id),
            (None, None) => {
                tracing::warn!(kind = %notification.kind, "Notification has neither topic nor target user, dropping");
                return;
            }
        };

        if let Some(batcher) = &self.batcher {
            let batch_topic = match notification.target_user {
                Some(_) => None,
                None => topic_id,
            };
            let users: HashSet<UserId> = targets.iter().map(|conn| conn.user_id()).collect();
            for user_id in users {
                batcher.add(
                    BatchKey {
                        topic_id: batch_topic,
                        user_id,
                    },
                    notification.clone(),
                );
            }
            return;
        }

        self.fan_out(targets, std::slice::from_ref(&notification)).await;
    }

    /// One enqueue attempt per connection per notification. A connection that
    /// cannot take a frame is evicted without affecting the others.
    async fn fan_out(&self, targets: Vec<Arc<ConnectionHandle>>, notifications: &[Arc<Notification>]) {
        for conn in targets {
            for notification in notifications {
                if let Err(e) = conn.enqueue(notification.clone()).await {
                    tracing::warn!(
                        connection_id = %conn.id(),
                        user_id = %conn.user_id(),
                        error = %e,
                        "Evicting connection that could not accept a notification"
                    );
                    self.evict(conn.id());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::Outbound;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn options(queue_size: usize) -> ConnectionOptions {
        ConnectionOptions {
            queue_size,
            enqueue_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn start(
        queue_size: usize,
        batcher: Option<NotificationBatcher>,
    ) -> (NotificationService, CancellationToken) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (inbound_tx, _) = mpsc::unbounded_channel();
        let (service, dispatch) =
            NotificationService::new(registry, options(queue_size), Arc::new(inbound_tx), batcher);
        let cancel = CancellationToken::new();
        tokio::spawn(dispatch.run(cancel.clone()));
        (service, cancel)
    }

    fn attach(
        service: &NotificationService,
        user: UserId,
        topics: &[TopicId],
        queue_size: usize,
    ) -> (Arc<ConnectionHandle>, Outbound) {
        let (handle, outbound) = ConnectionHandle::new(user, &options(queue_size));
        service.registry().add_connection(handle.clone(), topics);
        (handle, outbound)
    }

    async fn recv(outbound: &mut Outbound) -> Option<Arc<Notification>> {
        tokio::time::timeout(Duration::from_millis(200), outbound.rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_topic_delivery_reaches_each_subscriber_once() {
        let (service, cancel) = start(8, None);
        let topic = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (_a, mut a) = attach(&service, Uuid::new_v4(), &[topic], 8);
        let (_b, mut b) = attach(&service, Uuid::new_v4(), &[topic], 8);
        let (_c, mut c) = attach(&service, Uuid::new_v4(), &[other], 8);

        let n = Arc::new(Notification::new("message", json!({"content": "hi"})));
        service.deliver(Some(topic), n.clone()).unwrap();

        assert_eq!(recv(&mut a).await.as_deref(), Some(&*n));
        assert_eq!(recv(&mut b).await.as_deref(), Some(&*n));
        assert!(recv(&mut c).await.is_none());
        assert!(a.rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_target_user_hint_overrides_topic() {
        let (service, cancel) = start(8, None);
        let topic = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let (_a1, mut a1) = attach(&service, alice, &[topic], 8);
        let (_a2, mut a2) = attach(&service, alice, &[], 8);
        let (_b, mut b) = attach(&service, Uuid::new_v4(), &[topic], 8);

        let n = Arc::new(Notification::new("message", json!({})).for_user(alice));
        service.deliver(Some(topic), n).unwrap();

        assert!(recv(&mut a1).await.is_some());
        assert!(recv(&mut a2).await.is_some());
        assert!(recv(&mut b).await.is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_saturated_connection_is_evicted_alone() {
        let (service, cancel) = start(1, None);
        let topic = Uuid::new_v4();
        let (slow, mut slow_rx) = attach(&service, Uuid::new_v4(), &[topic], 1);
        let (healthy, mut healthy_rx) = attach(&service, Uuid::new_v4(), &[topic], 8);

        for i in 0..2 {
            let n = Arc::new(Notification::new("message", json!({ "seq": i })));
            service.deliver(Some(topic), n).unwrap();
        }

        assert!(recv(&mut healthy_rx).await.is_some());
        assert!(recv(&mut healthy_rx).await.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slow.is_closed());
        assert!(service.registry().get(slow.id()).is_none());
        assert!(service.registry().get(healthy.id()).is_some());
        // The frame queued before saturation is still there to flush.
        assert!(slow_rx.rx.try_recv().is_ok());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_membership_submissions_update_registry() {
        let (service, cancel) = start(8, None);
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        let user = Uuid::new_v4();
        let (conn, _rx) = attach(&service, user, &[t1], 8);

        service.apply_membership(user, vec![t2]).unwrap();
        service.join_topic(user, t1).unwrap();
        service.leave_topic(user, t2).unwrap();
        service.remove_topic(t1).unwrap();
        service.join_topic(user, t2).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(service.registry().topics_of(conn.id()), vec![t2]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_batched_delivery_preserves_order() {
        let (batcher, flusher) = NotificationBatcher::new(3, Duration::from_secs(5));
        let (service, cancel) = start(8, Some(batcher));
        let flush_service = service.clone();
        tokio::spawn(flusher.run(
            move |key, notifications| {
                let _ = flush_service.deliver_batch(key, notifications);
            },
            cancel.clone(),
        ));

        let topic = Uuid::new_v4();
        let (_a, mut a) = attach(&service, Uuid::new_v4(), &[topic], 8);
        for i in 0..3 {
            let n = Arc::new(Notification::new("message", json!({ "seq": i })));
            service.deliver(Some(topic), n).unwrap();
        }

        for i in 0..3 {
            let n = recv(&mut a).await.unwrap();
            assert_eq!(n.data["seq"], i);
        }
        cancel.cancel();
    }
}
