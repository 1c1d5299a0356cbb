//! Membership Registry
//!
//! Maps each chat to the Connection Actors currently subscribed to it.
//! Owned exclusively by the hub task; it holds no locks of its own.

use std::collections::HashMap;

use crate::connection::Connection;
use crate::types::{ChatId, ConnectionId};

/// Chat membership of active connections
#[derive(Debug, Default)]
pub struct Registry {
    /// ChatId -> (ConnectionId -> Connection)
    chats: HashMap<ChatId, HashMap<ConnectionId, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to its chat
    ///
    /// Returns false if it was already registered.
    pub fn insert(&mut self, connection: Connection) -> bool {
        let members = self.chats.entry(connection.chat_id()).or_default();
        if members.contains_key(&connection.id()) {
            return false;
        }
        members.insert(connection.id(), connection);
        true
    }

    /// Remove a connection from its chat
    ///
    /// Returns the registered handle, or None if it was not present.
    /// Empty chats are dropped.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let members = self.chats.get_mut(&id.chat_id)?;
        let removed = members.remove(id);
        if members.is_empty() {
            self.chats.remove(&id.chat_id);
        }
        removed
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.chats
            .get(&id.chat_id)
            .is_some_and(|members| members.contains_key(id))
    }

    /// Connections currently subscribed to a chat
    pub fn subscribers(&self, chat_id: ChatId) -> impl Iterator<Item = &Connection> {
        self.chats
            .get(&chat_id)
            .into_iter()
            .flat_map(|members| members.values())
    }

    pub fn subscriber_count(&self, chat_id: ChatId) -> usize {
        self.chats.get(&chat_id).map_or(0, HashMap::len)
    }

    /// Number of chats with at least one subscriber
    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    pub fn connection_count(&self) -> usize {
        self.chats.values().map(HashMap::len).sum()
    }

    /// Remove every connection, leaving the registry empty
    pub fn drain(&mut self) -> Vec<Connection> {
        self.chats
            .drain()
            .flat_map(|(_, members)| members.into_values())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    fn connection(user: i64, chat: ChatId) -> Connection {
        Connection::new(UserId(user), chat, 4).0
    }

    #[test]
    fn test_registry_insert_is_idempotent() {
        let chat = ChatId::new();
        let conn = connection(1, chat);
        let mut registry = Registry::new();

        assert!(registry.insert(conn.clone()));
        assert!(!registry.insert(conn.clone()));
        assert_eq!(registry.subscriber_count(chat), 1);
        assert!(registry.contains(&conn.id()));
    }

    #[test]
    fn test_registry_indexes_by_chat() {
        let chat_x = ChatId::new();
        let chat_y = ChatId::new();
        let mut registry = Registry::new();

        registry.insert(connection(1, chat_x));
        registry.insert(connection(2, chat_x));
        registry.insert(connection(1, chat_y));

        assert_eq!(registry.subscriber_count(chat_x), 2);
        assert_eq!(registry.subscriber_count(chat_y), 1);
        assert_eq!(registry.chat_count(), 2);
        assert_eq!(registry.connection_count(), 3);

        let mut users: Vec<_> = registry.subscribers(chat_x).map(|c| c.user_id()).collect();
        users.sort();
        assert_eq!(users, vec![UserId(1), UserId(2)]);
    }

    #[test]
    fn test_registry_remove() {
        let chat = ChatId::new();
        let conn = connection(1, chat);
        let mut registry = Registry::new();
        registry.insert(conn.clone());

        assert!(registry.remove(&conn.id()).is_some());
        assert!(!registry.contains(&conn.id()));
        assert_eq!(registry.chat_count(), 0);

        // Absent connection is a no-op
        assert!(registry.remove(&conn.id()).is_none());
    }

    #[test]
    fn test_registry_same_user_two_sessions() {
        let chat = ChatId::new();
        let mut registry = Registry::new();

        assert!(registry.insert(connection(1, chat)));
        assert!(registry.insert(connection(1, chat)));
        assert_eq!(registry.subscriber_count(chat), 2);
    }

    #[test]
    fn test_registry_drain() {
        let chat = ChatId::new();
        let mut registry = Registry::new();
        registry.insert(connection(1, chat));
        registry.insert(connection(2, ChatId::new()));

        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.subscribers(chat).count(), 0);
    }
}
