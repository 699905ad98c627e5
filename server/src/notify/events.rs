//! Turns domain events into notifications and membership changes.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::hub::Hub;
use crate::lookup::{MembershipLookup, ReadModel};
use crate::ws::{Notification, TopicId, UserId};

/// Events emitted by the conversation domain once a command has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    MessageSent {
        message_id: Uuid,
        conversation_id: TopicId,
        sender_id: UserId,
    },
    GroupConversationCreated {
        conversation_id: TopicId,
        creator_id: UserId,
        member_ids: Vec<UserId>,
    },
    GroupConversationRenamed {
        conversation_id: TopicId,
        renamed_by: UserId,
        name: String,
    },
    GroupConversationJoined {
        conversation_id: TopicId,
        user_id: UserId,
    },
    GroupConversationInvited {
        conversation_id: TopicId,
        inviter_id: UserId,
        invitee_id: UserId,
    },
    GroupConversationLeft {
        conversation_id: TopicId,
        user_id: UserId,
    },
    GroupConversationDeleted {
        conversation_id: TopicId,
    },
    DirectConversationCreated {
        conversation_id: TopicId,
        user_ids: Vec<UserId>,
    },
}

pub struct NotificationEventHandler {
    hub: Arc<Hub>,
    membership: Arc<dyn MembershipLookup>,
    read_model: Arc<dyn ReadModel>,
}

impl NotificationEventHandler {
    pub fn new(
        hub: Arc<Hub>,
        membership: Arc<dyn MembershipLookup>,
        read_model: Arc<dyn ReadModel>,
    ) -> Self {
        Self {
            hub,
            membership,
            read_model,
        }
    }

    /// Consume events until the stream ends or `cancel` fires.
    pub async fn run<St>(self, mut events: St, cancel: CancellationToken)
    where
        St: Stream<Item = DomainEvent> + Unpin,
    {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(&event).await;
        }
        tracing::debug!("Domain event handler stopped");
    }

    pub async fn handle(&self, event: &DomainEvent) {
        match event {
            DomainEvent::MessageSent {
                message_id,
                conversation_id,
                ..
            } => self.message_sent(*message_id, *conversation_id).await,
            DomainEvent::GroupConversationCreated {
                creator_id,
                member_ids,
                ..
            } => {
                self.invalidate(std::iter::once(creator_id).chain(member_ids))
                    .await;
            }
            DomainEvent::DirectConversationCreated { user_ids, .. } => {
                self.invalidate(user_ids).await;
            }
            DomainEvent::GroupConversationRenamed {
                conversation_id, ..
            } => self.conversation_updated(*conversation_id).await,
            DomainEvent::GroupConversationJoined {
                conversation_id,
                user_id,
            }
            | DomainEvent::GroupConversationLeft {
                conversation_id,
                user_id,
            } => {
                self.invalidate([user_id]).await;
                self.conversation_updated(*conversation_id).await;
            }
            DomainEvent::GroupConversationInvited {
                conversation_id,
                invitee_id,
                ..
            } => {
                self.invalidate([invitee_id]).await;
                self.conversation_updated(*conversation_id).await;
            }
            DomainEvent::GroupConversationDeleted { conversation_id } => {
                self.conversation_deleted(*conversation_id).await
            }
        }
    }

    async fn members(&self, conversation_id: TopicId) -> Vec<UserId> {
        match self.membership.members_of(conversation_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(topic_id = %conversation_id, error = %e, "Member lookup failed");
                Vec::new()
            }
        }
    }

    async fn invalidate<'a>(&self, users: impl IntoIterator<Item = &'a UserId>) {
        for user_id in users {
            if let Err(e) = self.hub.invalidate_membership(*user_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "Membership invalidation not relayed");
            }
        }
    }

    async fn message_sent(&self, message_id: Uuid, conversation_id: TopicId) {
        for viewer in self.members(conversation_id).await {
            let view = match self.read_model.message_view(message_id, viewer).await {
                Ok(view) => view,
                Err(e) => {
                    tracing::warn!(message_id = %message_id, user_id = %viewer, error = %e, "Message view unavailable");
                    continue;
                }
            };
            let notification = Notification::new("message", view).for_user(viewer);
            if let Err(e) = self.hub.broadcast(conversation_id, notification).await {
                tracing::warn!(topic_id = %conversation_id, user_id = %viewer, error = %e, "Message notification failed");
            }
        }
    }

    async fn conversation_updated(&self, conversation_id: TopicId) {
        for viewer in self.members(conversation_id).await {
            let view = match self.read_model.conversation_view(conversation_id, viewer).await {
                Ok(view) => view,
                Err(e) => {
                    tracing::warn!(topic_id = %conversation_id, user_id = %viewer, error = %e, "Conversation view unavailable");
                    continue;
                }
            };
            let notification = Notification::new("conversation_updated", view);
            if let Err(e) = self.hub.send_to_user(viewer, notification).await {
                tracing::warn!(topic_id = %conversation_id, user_id = %viewer, error = %e, "Conversation update failed");
            }
        }
    }

    async fn conversation_deleted(&self, conversation_id: TopicId) {
        let notification =
            Notification::new("conversation_deleted", json!({ "conversation_id": conversation_id }));
        if let Err(e) = self.hub.broadcast(conversation_id, notification).await {
            tracing::warn!(topic_id = %conversation_id, error = %e, "Deletion notice failed");
        }
        if let Err(e) = self.hub.remove_topic(conversation_id).await {
            tracing::warn!(topic_id = %conversation_id, error = %e, "Topic removal not relayed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubSettings;
    use crate::lookup::{InMemoryMembership, LookupError};
    use crate::relay::{MemoryBus, MessageBus};
    use crate::ws::connection::Outbound;
    use crate::ws::{ConnectionHandle, ConnectionOptions, InboundMessage};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Views;

    #[async_trait]
    impl ReadModel for Views {
        async fn message_view(&self, message_id: Uuid, viewer: UserId) -> Result<Value, LookupError> {
            Ok(json!({ "id": message_id, "viewer": viewer }))
        }

        async fn conversation_view(
            &self,
            conversation_id: TopicId,
            viewer: UserId,
        ) -> Result<Value, LookupError> {
            Ok(json!({ "id": conversation_id, "viewer": viewer }))
        }
    }

    async fn setup() -> (Arc<Hub>, Arc<InMemoryMembership>, NotificationEventHandler) {
        let membership = Arc::new(InMemoryMembership::new());
        let (inbound_tx, _) = mpsc::unbounded_channel::<InboundMessage>();
        let hub = Arc::new(
            Hub::start(
                HubSettings::default(),
                Arc::new(MemoryBus::new()) as Arc<dyn MessageBus>,
                membership.clone(),
                Arc::new(inbound_tx),
            )
            .await
            .unwrap(),
        );
        let handler = NotificationEventHandler::new(hub.clone(), membership.clone(), Arc::new(Views));
        (hub, membership, handler)
    }

    fn attach(hub: &Hub, user: UserId, topics: &[TopicId]) -> (Arc<ConnectionHandle>, Outbound) {
        let (handle, outbound) = ConnectionHandle::new(user, &ConnectionOptions::default());
        hub.registry().add_connection(handle.clone(), topics);
        (handle, outbound)
    }

    async fn recv(outbound: &mut Outbound) -> Option<Arc<Notification>> {
        tokio::time::timeout(Duration::from_millis(200), outbound.rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_message_sent_renders_per_viewer() {
        let (hub, membership, handler) = setup().await;
        let topic = Uuid::new_v4();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        membership.join(topic, alice);
        membership.join(topic, bob);
        let (_a, mut a) = attach(&hub, alice, &[topic]);
        let (_b, mut b) = attach(&hub, bob, &[topic]);
        let (_c, mut c) = attach(&hub, carol, &[]);

        let message_id = Uuid::new_v4();
        handler
            .handle(&DomainEvent::MessageSent {
                message_id,
                conversation_id: topic,
                sender_id: alice,
            })
            .await;

        let for_alice = recv(&mut a).await.unwrap();
        assert_eq!(for_alice.kind, "message");
        assert_eq!(for_alice.data["viewer"], alice.to_string());
        let for_bob = recv(&mut b).await.unwrap();
        assert_eq!(for_bob.data["viewer"], bob.to_string());
        assert!(recv(&mut a).await.is_none());
        assert!(recv(&mut c).await.is_none());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_subscribes_open_connection_and_notifies() {
        let (hub, membership, handler) = setup().await;
        let topic = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (conn, mut rx) = attach(&hub, user, &[]);

        membership.join(topic, user);
        handler
            .handle(&DomainEvent::GroupConversationJoined {
                conversation_id: topic,
                user_id: user,
            })
            .await;

        let update = recv(&mut rx).await.unwrap();
        assert_eq!(update.kind, "conversation_updated");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.registry().topics_of(conn.id()), vec![topic]);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_deletion_notifies_then_drops_topic() {
        let (hub, membership, handler) = setup().await;
        let topic = Uuid::new_v4();
        let user = Uuid::new_v4();
        membership.join(topic, user);
        let (conn, mut rx) = attach(&hub, user, &[topic]);

        handler
            .handle(&DomainEvent::GroupConversationDeleted {
                conversation_id: topic,
            })
            .await;

        let notice = recv(&mut rx).await.unwrap();
        assert_eq!(notice.kind, "conversation_deleted");
        assert_eq!(notice.data["conversation_id"], topic.to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.registry().topics_of(conn.id()).is_empty());
        hub.shutdown().await;
    }

    #[test]
    fn test_event_wire_format() {
        let event: DomainEvent = serde_json::from_value(json!({
            "type": "group_conversation_left",
            "conversation_id": Uuid::nil(),
            "user_id": Uuid::nil(),
        }))
        .unwrap();
        assert_eq!(
            event,
            DomainEvent::GroupConversationLeft {
                conversation_id: Uuid::nil(),
                user_id: Uuid::nil(),
            }
        );
    }
}
