//! Message protocol definitions
//!
//! JSON wire frames exchanged with clients, the closed set of inbound
//! commands, and the internal Broadcast Envelope consumed by the hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ChatId, KeyMap, MessageId, UserId};

/// Per-recipient delivery status
///
/// Ordered so that `Delivered < Read`; a status only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Apply an update, refusing to regress from `Read` to `Delivered`
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame type carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    NewMessage,
    ReadReceipt,
    StatusUpdate,
}

/// Server → Client wire frame
///
/// One JSON object per WebSocket text message. Optional fields are omitted
/// when absent, so a `status_update` never carries `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Only ever the recipient's own entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeyMap>,
    pub chat_id: ChatId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

/// Client → Server command
///
/// Closed set validated at deserialization. Any other `type` value lands in
/// `Unknown`. Client-supplied `user_id` and `chat_id` are ignored; identity
/// comes from the authenticated connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    /// Send an encrypted message, optionally with per-recipient keys
    NewMessage {
        content: String,
        #[serde(default)]
        keys: Option<KeyMap>,
    },
    /// Acknowledge that a message was read
    ReadReceipt { message_id: MessageId },
    /// Unrecognized command type
    #[serde(other)]
    Unknown,
}

impl InboundCommand {
    /// Parse a text frame into a command
    ///
    /// Text that is not a JSON object is `Malformed`. An object with missing
    /// or mistyped fields is `Mismatched`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Ok(serde_json::from_value(value)?);
        }
        serde_json::from_value(value).map_err(ProtocolError::Mismatched)
    }

    /// Reject commands that are well-formed JSON but carry unusable values
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            InboundCommand::NewMessage { content, keys } => {
                if content.is_empty() {
                    return Err(ProtocolError::Invalid("content must not be empty"));
                }
                if keys
                    .as_ref()
                    .is_some_and(|keys| keys.values().any(String::is_empty))
                {
                    return Err(ProtocolError::Invalid("encrypted keys must not be empty"));
                }
                Ok(())
            }
            InboundCommand::ReadReceipt { message_id } => {
                if message_id.0 <= 0 {
                    return Err(ProtocolError::Invalid("message_id must be positive"));
                }
                Ok(())
            }
            InboundCommand::Unknown => Ok(()),
        }
    }
}

/// What a Broadcast Envelope carries
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopePayload {
    /// Freshly persisted message; `keys == None` means plaintext fan-out
    NewMessage {
        content: String,
        keys: Option<KeyMap>,
    },
    /// Status change of an existing message
    StatusUpdate { status: DeliveryStatus },
}

/// Pre-fan-out representation of one event for a chat
///
/// Holds the full key map. Consumed exactly once by the hub, which turns it
/// into recipient-scoped frames with [`BroadcastEnvelope::frame_for`].
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEnvelope {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserId,
    pub timestamp: DateTime<Utc>,
    pub payload: EnvelopePayload,
}

impl BroadcastEnvelope {
    pub fn new_message(
        message_id: MessageId,
        chat_id: ChatId,
        sender: UserId,
        content: String,
        keys: Option<KeyMap>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            chat_id,
            sender,
            timestamp,
            payload: EnvelopePayload::NewMessage { content, keys },
        }
    }

    pub fn status_update(
        message_id: MessageId,
        chat_id: ChatId,
        sender: UserId,
        status: DeliveryStatus,
    ) -> Self {
        Self {
            message_id,
            chat_id,
            sender,
            timestamp: Utc::now(),
            payload: EnvelopePayload::StatusUpdate { status },
        }
    }

    /// Build the frame for one recipient
    ///
    /// Returns `None` when the envelope is end-to-end encrypted and carries
    /// no key for `recipient`: ciphertext is never forwarded without a key.
    pub fn frame_for(&self, recipient: UserId) -> Option<Frame> {
        match &self.payload {
            EnvelopePayload::NewMessage { content, keys } => {
                let keys = match keys {
                    Some(keys) => {
                        let key = keys.get(&recipient)?;
                        Some(KeyMap::from([(recipient, key.clone())]))
                    }
                    None => None,
                };
                let status = if recipient == self.sender {
                    DeliveryStatus::Read
                } else {
                    DeliveryStatus::Delivered
                };
                Some(Frame {
                    id: Some(self.message_id),
                    frame_type: FrameType::NewMessage,
                    content: Some(content.clone()),
                    keys,
                    chat_id: self.chat_id,
                    user_id: self.sender,
                    status: Some(status),
                    timestamp: Some(self.timestamp),
                    message_id: None,
                })
            }
            EnvelopePayload::StatusUpdate { status } => Some(Frame {
                id: None,
                frame_type: FrameType::StatusUpdate,
                content: None,
                keys: None,
                chat_id: self.chat_id,
                user_id: self.sender,
                status: Some(*status),
                timestamp: Some(self.timestamp),
                message_id: Some(self.message_id),
            }),
        }
    }
}
