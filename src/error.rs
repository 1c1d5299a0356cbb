//! Error types for the hub
//!
//! Defines connection-level errors, protocol errors, collaborator errors and
//! outbound queue errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::{ChatId, MessageId, UserId};

/// Connection-level errors
///
/// Every variant is fatal to the single connection it occurred on and is
/// never propagated beyond that connection's teardown.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The hub task has stopped
    #[error("Hub is not running")]
    HubClosed,

    /// Upgrade request was rejected before the handshake completed
    #[error("Upgrade rejected: {0}")]
    Rejected(#[from] AuthError),

    /// Authenticated user is not a participant of the requested chat
    #[error("User {user_id} is not a member of chat {chat_id}")]
    NotChatMember { user_id: UserId, chat_id: ChatId },

    /// Message Store failure while admitting the connection
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Connection state machine was driven out of order
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors raised while handling inbound frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not a JSON command object
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// JSON object whose fields do not fit its command type
    #[error("Invalid command fields: {0}")]
    Mismatched(serde_json::Error),

    /// Well-formed command that failed validation
    #[error("Invalid command: {0}")]
    Invalid(&'static str),

    /// Illegal connection state transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The hub task has stopped
    #[error("Hub is not running")]
    HubClosed,
}

impl ProtocolError {
    /// Whether the error must tear the connection down
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Invalid(_) | ProtocolError::Mismatched(_))
    }
}

/// Message Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Chat not found: {0}")]
    ChatNotFound(ChatId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Message {message_id} does not belong to chat {chat_id}")]
    WrongChat {
        message_id: MessageId,
        chat_id: ChatId,
    },

    /// User has no status entry for the message, or is not in the chat
    #[error("User {user_id} is not a participant of {scope}")]
    NotParticipant { user_id: UserId, scope: String },

    /// Backend unavailable or failed
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Upgrade authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing access token")]
    MissingToken,

    #[error("Invalid access token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid upgrade path: {0}")]
    InvalidPath(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("Failed to read seed file: {0}")]
    Seed(String),
}

/// Outbound queue errors
///
/// Occurs when enqueueing a frame onto a Connection Actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The bounded queue is full; the actor must be evicted
    #[error("Outbound queue full")]
    QueueFull,

    /// The actor has been closed
    #[error("Connection closed")]
    Closed,
}
