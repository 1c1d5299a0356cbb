//! Message Store collaborator
//!
//! The hub persists messages and delivery status through the `MessageStore`
//! trait. `InMemoryStore` backs the binary and the tests; a database-backed
//! store plugs in behind the same trait.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{ConfigError, StoreError};
use crate::message::DeliveryStatus;
use crate::types::{ChatId, KeyMap, MessageId, UserId};

/// Result of persisting a new message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedMessage {
    pub message_id: MessageId,
    /// Sender's own status, always `Read`
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message with its per-recipient keys
    ///
    /// Creates a status entry for every chat member: `Read` for the sender,
    /// `Delivered` for everyone else.
    async fn persist_message(
        &self,
        chat_id: ChatId,
        sender: UserId,
        ciphertext: &str,
        recipient_keys: Option<&KeyMap>,
    ) -> Result<PersistedMessage, StoreError>;

    /// Set the status of one user's copy of a message in `chat_id`
    ///
    /// Fails without changing anything when the message belongs to another
    /// chat. Regressing from `Read` to `Delivered` is ignored.
    async fn update_status(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryStatus,
    ) -> Result<(), StoreError>;

    /// Members of a chat
    async fn get_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError>;
}

/// A persisted message as held by `InMemoryStore`
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub chat_id: ChatId,
    pub sender: UserId,
    pub content: String,
    pub keys: KeyMap,
    pub statuses: HashMap<UserId, DeliveryStatus>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreState {
    chats: HashMap<ChatId, BTreeSet<UserId>>,
    messages: BTreeMap<MessageId, StoredMessage>,
    last_message_id: i64,
}

/// Chat membership seed loaded by the binary
///
/// ```json
/// { "chats": [ { "id": "6f1c...", "members": [1, 2] } ] }
/// ```
#[derive(Debug, Deserialize)]
pub struct Seed {
    pub chats: Vec<SeedChat>,
}

#[derive(Debug, Deserialize)]
pub struct SeedChat {
    pub id: ChatId,
    pub members: Vec<UserId>,
}

/// Process-local Message Store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a seed file
    pub fn from_seed_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Seed(format!("{}: {}", path.display(), e)))?;
        let seed: Seed = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Seed(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_seed(seed))
    }

    pub fn from_seed(seed: Seed) -> Self {
        let chats = seed
            .chats
            .into_iter()
            .map(|chat| (chat.id, chat.members.into_iter().collect()))
            .collect();
        Self {
            state: RwLock::new(StoreState {
                chats,
                ..StoreState::default()
            }),
        }
    }

    /// Create or replace a chat's member list
    pub async fn create_chat(&self, chat_id: ChatId, members: impl IntoIterator<Item = UserId>) {
        let mut state = self.state.write().await;
        state.chats.insert(chat_id, members.into_iter().collect());
    }

    pub async fn message(&self, message_id: MessageId) -> Option<StoredMessage> {
        self.state.read().await.messages.get(&message_id).cloned()
    }

    pub async fn status_of(&self, message_id: MessageId, user_id: UserId) -> Option<DeliveryStatus> {
        self.state
            .read()
            .await
            .messages
            .get(&message_id)
            .and_then(|m| m.statuses.get(&user_id).copied())
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn persist_message(
        &self,
        chat_id: ChatId,
        sender: UserId,
        ciphertext: &str,
        recipient_keys: Option<&KeyMap>,
    ) -> Result<PersistedMessage, StoreError> {
        let mut state = self.state.write().await;

        let members = state
            .chats
            .get(&chat_id)
            .ok_or(StoreError::ChatNotFound(chat_id))?;
        if !members.contains(&sender) {
            return Err(StoreError::NotParticipant {
                user_id: sender,
                scope: format!("chat {}", chat_id),
            });
        }

        let statuses = members
            .iter()
            .map(|&member| {
                let status = if member == sender {
                    DeliveryStatus::Read
                } else {
                    DeliveryStatus::Delivered
                };
                (member, status)
            })
            .collect();

        state.last_message_id += 1;
        let message_id = MessageId(state.last_message_id);
        let sent_at = Utc::now();

        state.messages.insert(
            message_id,
            StoredMessage {
                chat_id,
                sender,
                content: ciphertext.to_string(),
                keys: recipient_keys.cloned().unwrap_or_default(),
                statuses,
                sent_at,
            },
        );

        Ok(PersistedMessage {
            message_id,
            status: DeliveryStatus::Read,
            timestamp: sent_at,
        })
    }

    async fn update_status(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if message.chat_id != chat_id {
            return Err(StoreError::WrongChat {
                message_id,
                chat_id,
            });
        }
        let current = message
            .statuses
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotParticipant {
                user_id,
                scope: format!("message {}", message_id),
            })?;

        *current = current.advance(status);
        Ok(())
    }

    async fn get_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError> {
        self.state
            .read()
            .await
            .chats
            .get(&chat_id)
            .map(|members| members.iter().copied().collect())
            .ok_or(StoreError::ChatNotFound(chat_id))
    }
}
