//! Ports to the domain layer: who belongs to which topic, and how a message
//! or conversation renders for a given viewer.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::ws::{TopicId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("not found: {0}")]
    NotFound(Uuid),
    #[error("lookup backend failed: {0}")]
    Backend(String),
}

/// Authoritative membership facts.
#[async_trait]
pub trait MembershipLookup: Send + Sync + 'static {
    /// Topics the user currently belongs to.
    async fn topics_for_user(&self, user_id: UserId) -> Result<Vec<TopicId>, LookupError>;

    /// Current members of a topic.
    async fn members_of(&self, topic_id: TopicId) -> Result<Vec<UserId>, LookupError>;
}

/// Viewer-specific renderings used as notification payloads.
#[async_trait]
pub trait ReadModel: Send + Sync + 'static {
    async fn message_view(&self, message_id: Uuid, viewer: UserId) -> Result<Value, LookupError>;

    async fn conversation_view(
        &self,
        conversation_id: TopicId,
        viewer: UserId,
    ) -> Result<Value, LookupError>;
}

/// Membership kept in memory, for standalone mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryMembership {
    members: DashMap<TopicId, HashSet<UserId>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, topic_id: TopicId, user_id: UserId) {
        self.members.entry(topic_id).or_default().insert(user_id);
    }

    pub fn leave(&self, topic_id: TopicId, user_id: UserId) {
        if let Some(mut users) = self.members.get_mut(&topic_id) {
            users.remove(&user_id);
        }
        self.members.remove_if(&topic_id, |_, users| users.is_empty());
    }

    pub fn remove_topic(&self, topic_id: TopicId) {
        self.members.remove(&topic_id);
    }
}

#[async_trait]
impl MembershipLookup for InMemoryMembership {
    async fn topics_for_user(&self, user_id: UserId) -> Result<Vec<TopicId>, LookupError> {
        Ok(self
            .members
            .iter()
            .filter(|entry| entry.value().contains(&user_id))
            .map(|entry| *entry.key())
            .collect())
    }

    async fn members_of(&self, topic_id: TopicId) -> Result<Vec<UserId>, LookupError> {
        Ok(self
            .members
            .get(&topic_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_leave_roundtrip() {
        let membership = InMemoryMembership::new();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        membership.join(t1, alice);
        membership.join(t1, bob);
        membership.join(t2, alice);

        let mut topics = membership.topics_for_user(alice).await.unwrap();
        topics.sort();
        let mut expected = vec![t1, t2];
        expected.sort();
        assert_eq!(topics, expected);

        membership.leave(t1, alice);
        assert_eq!(membership.topics_for_user(alice).await.unwrap(), vec![t2]);
        assert_eq!(membership.members_of(t1).await.unwrap(), vec![bob]);

        membership.leave(t1, bob);
        assert!(membership.members_of(t1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_topic_drops_all_members() {
        let membership = InMemoryMembership::new();
        let topic = Uuid::new_v4();
        let user = Uuid::new_v4();
        membership.join(topic, user);
        membership.remove_topic(topic);
        assert!(membership.topics_for_user(user).await.unwrap().is_empty());
    }
}
