//! In-memory index of live connections, by owner and by topic.
//!
//! Both indexes live behind one `RwLock` so a connection is added to or
//! purged from every index inside a single exclusive section. Readers get
//! snapshots, so no lock is held while a delivery waits on a slow socket.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{ConnectionHandle, ConnectionId, TopicId, UserId};

#[derive(Default)]
struct Indexes {
    connections: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_topic: HashMap<TopicId, HashSet<ConnectionId>>,
    topics_of: HashMap<ConnectionId, HashSet<TopicId>>,
}

impl Indexes {
    fn link(&mut self, id: ConnectionId, topic_id: TopicId) {
        self.by_topic.entry(topic_id).or_default().insert(id);
        self.topics_of.entry(id).or_default().insert(topic_id);
    }

    fn unlink(&mut self, id: ConnectionId, topic_id: TopicId) -> bool {
        let mut removed = false;
        if let Some(members) = self.by_topic.get_mut(&topic_id) {
            removed = members.remove(&id);
            if members.is_empty() {
                self.by_topic.remove(&topic_id);
            }
        }
        if let Some(topics) = self.topics_of.get_mut(&id) {
            topics.remove(&topic_id);
        }
        removed
    }

    fn snapshot<'a>(&self, ids: impl Iterator<Item = &'a ConnectionId>) -> Vec<Arc<ConnectionHandle>> {
        ids.filter_map(|id| self.connections.get(id).cloned()).collect()
    }

    fn user_connections(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexes> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexes> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a connection and subscribe it to its initial topics.
    pub fn add_connection(&self, handle: Arc<ConnectionHandle>, topics: &[TopicId]) {
        let id = handle.id();
        let user_id = handle.user_id();
        let mut idx = self.write();
        idx.connections.insert(id, handle);
        idx.by_user.entry(user_id).or_default().insert(id);
        idx.topics_of.entry(id).or_default();
        for topic_id in topics {
            idx.link(id, *topic_id);
        }
        tracing::debug!(
            connection_id = %id,
            user_id = %user_id,
            topics = topics.len(),
            user_connections = idx.by_user.get(&user_id).map(|c| c.len()).unwrap_or(0),
            "Connection registered"
        );
    }

    /// Purge a connection from every index. Returns the handle if it was present.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let mut idx = self.write();
        let handle = idx.connections.remove(&id)?;
        let user_id = handle.user_id();

        let mut remove_user = false;
        if let Some(ids) = idx.by_user.get_mut(&user_id) {
            ids.remove(&id);
            remove_user = ids.is_empty();
        }
        if remove_user {
            idx.by_user.remove(&user_id);
        }

        let topics = idx.topics_of.remove(&id).unwrap_or_default();
        for topic_id in topics {
            let mut remove_topic = false;
            if let Some(members) = idx.by_topic.get_mut(&topic_id) {
                members.remove(&id);
                remove_topic = members.is_empty();
            }
            if remove_topic {
                idx.by_topic.remove(&topic_id);
            }
        }

        tracing::debug!(connection_id = %id, user_id = %user_id, "Connection unregistered");
        Some(handle)
    }

    /// Subscribe one connection to a topic. Returns false for unknown connections.
    pub fn add_to_topic(&self, id: ConnectionId, topic_id: TopicId) -> bool {
        let mut idx = self.write();
        if !idx.connections.contains_key(&id) {
            return false;
        }
        idx.link(id, topic_id);
        true
    }

    /// Unsubscribe one connection from a topic. Returns true if it was subscribed.
    pub fn remove_from_topic(&self, id: ConnectionId, topic_id: TopicId) -> bool {
        self.write().unlink(id, topic_id)
    }

    /// Subscribe every connection of a user to a topic.
    pub fn add_user_to_topic(&self, user_id: UserId, topic_id: TopicId) -> usize {
        let mut idx = self.write();
        let ids = idx.user_connections(user_id);
        for id in &ids {
            idx.link(*id, topic_id);
        }
        ids.len()
    }

    /// Unsubscribe every connection of a user from a topic.
    pub fn remove_user_from_topic(&self, user_id: UserId, topic_id: TopicId) -> usize {
        let mut idx = self.write();
        let ids = idx.user_connections(user_id);
        ids.into_iter().filter(|id| idx.unlink(*id, topic_id)).count()
    }

    /// Drop a topic entirely, e.g. when its conversation is deleted.
    pub fn remove_topic(&self, topic_id: TopicId) -> usize {
        let mut idx = self.write();
        let members = idx.by_topic.remove(&topic_id).unwrap_or_default();
        for id in &members {
            if let Some(topics) = idx.topics_of.get_mut(id) {
                topics.remove(&topic_id);
            }
        }
        members.len()
    }

    /// Reconcile every connection of `user_id` with the user's current topic
    /// list, read beforehand from the membership source. Connections start or
    /// stop observing topics without reconnecting.
    pub fn invalidate_membership(&self, user_id: UserId, topics: &[TopicId]) {
        let desired: HashSet<TopicId> = topics.iter().copied().collect();
        let mut idx = self.write();
        let ids = idx.user_connections(user_id);
        let (mut added, mut removed) = (0usize, 0usize);

        for id in ids {
            let current = idx.topics_of.get(&id).cloned().unwrap_or_default();
            for stale in current.difference(&desired) {
                idx.unlink(id, *stale);
                removed += 1;
            }
            for fresh in desired.difference(&current) {
                idx.link(id, *fresh);
                added += 1;
            }
        }

        tracing::debug!(user_id = %user_id, added, removed, "Membership reconciled");
    }

    pub fn connections_by_topic(&self, topic_id: TopicId) -> Vec<Arc<ConnectionHandle>> {
        let idx = self.read();
        match idx.by_topic.get(&topic_id) {
            Some(ids) => idx.snapshot(ids.iter()),
            None => Vec::new(),
        }
    }

    pub fn connections_by_user(&self, user_id: UserId) -> Vec<Arc<ConnectionHandle>> {
        let idx = self.read();
        match idx.by_user.get(&user_id) {
            Some(ids) => idx.snapshot(ids.iter()),
            None => Vec::new(),
        }
    }

    pub fn topics_of(&self, id: ConnectionId) -> Vec<TopicId> {
        self.read()
            .topics_of
            .get(&id)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.read().connections.get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Every connection in the by-topic index is also indexed under its owner,
    /// and the per-connection topic sets mirror the by-topic index.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let idx = self.read();
        for (topic_id, members) in &idx.by_topic {
            assert!(!members.is_empty(), "empty topic set left behind for {topic_id}");
            for id in members {
                let handle = idx.connections.get(id).expect("topic member without connection");
                let owned = idx.by_user.get(&handle.user_id()).expect("owner missing");
                assert!(owned.contains(id));
                assert!(idx.topics_of[id].contains(topic_id));
            }
        }
        for (id, topics) in &idx.topics_of {
            assert!(idx.connections.contains_key(id));
            for topic_id in topics {
                assert!(idx.by_topic[topic_id].contains(id));
            }
        }
        for (user_id, ids) in &idx.by_user {
            assert!(!ids.is_empty());
            for id in ids {
                assert_eq!(idx.connections[id].user_id(), *user_id);
            }
        }
    }
}
