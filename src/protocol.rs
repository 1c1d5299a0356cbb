//! Protocol State Machine
//!
//! Tracks each connection's lifecycle and turns validated inbound commands
//! into persistence calls and Broadcast Envelopes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::hub::HubHandle;
use crate::message::{BroadcastEnvelope, DeliveryStatus, InboundCommand};
use crate::store::MessageStore;
use crate::types::{KeyMap, MessageId};

/// Lifecycle of a connection
///
/// `Unauthenticated → Upgraded → Active → Closed`. `Closed` is absorbing and
/// reachable from every state. Only `Active` connections are registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Upgraded,
    Active,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unauthenticated => "unauthenticated",
            ConnectionState::Upgraded => "upgraded",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        }
    }

    /// Handshake completed with a valid token
    pub fn upgrade(self) -> Result<Self, ProtocolError> {
        self.transition(ConnectionState::Unauthenticated, ConnectionState::Upgraded)
    }

    /// Membership confirmed and connection registered
    pub fn activate(self) -> Result<Self, ProtocolError> {
        self.transition(ConnectionState::Upgraded, ConnectionState::Active)
    }

    /// Any terminal error or explicit close
    pub fn close(self) -> Self {
        ConnectionState::Closed
    }

    fn transition(self, from: Self, to: Self) -> Result<Self, ProtocolError> {
        if self == from {
            Ok(to)
        } else {
            Err(ProtocolError::InvalidTransition {
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection command handler, owned by the reader task
pub struct Session {
    connection: Connection,
    state: ConnectionState,
    store: Arc<dyn MessageStore>,
    hub: HubHandle,
}

impl Session {
    pub fn new(
        connection: Connection,
        state: ConnectionState,
        store: Arc<dyn MessageStore>,
        hub: HubHandle,
    ) -> Self {
        Self {
            connection,
            state,
            store,
            hub,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle one inbound text frame
    ///
    /// Only fatal errors are returned: text that is not a JSON object and a
    /// stopped hub. Commands with bad fields or values and persistence
    /// failures are logged and dropped.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        if self.state != ConnectionState::Active {
            debug!(
                connection = %self.connection.id(),
                state = %self.state,
                "Ignoring frame on inactive connection"
            );
            return Ok(());
        }

        let command = match InboundCommand::parse(text) {
            Ok(command) => command,
            Err(e) if !e.is_fatal() => {
                warn!(connection = %self.connection.id(), "{}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = command.validate() {
            warn!(connection = %self.connection.id(), "{}", e);
            return Ok(());
        }

        match command {
            InboundCommand::NewMessage { content, keys } => {
                self.handle_new_message(content, keys).await
            }
            InboundCommand::ReadReceipt { message_id } => {
                self.handle_read_receipt(message_id).await
            }
            InboundCommand::Unknown => {
                warn!(connection = %self.connection.id(), "Unrecognized command type");
                Ok(())
            }
        }
    }

    /// Mark the session closed and close its connection
    pub fn close(&mut self) {
        self.state = self.state.close();
        self.connection.close();
    }

    async fn handle_new_message(
        &mut self,
        content: String,
        keys: Option<KeyMap>,
    ) -> Result<(), ProtocolError> {
        let chat_id = self.connection.chat_id();
        let sender = self.connection.user_id();

        let persisted = match self
            .store
            .persist_message(chat_id, sender, &content, keys.as_ref())
            .await
        {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(
                    chat_id = %chat_id,
                    user_id = %sender,
                    "Failed to persist message, dropping: {}",
                    e
                );
                return Ok(());
            }
        };

        debug!(
            message_id = %persisted.message_id,
            chat_id = %chat_id,
            user_id = %sender,
            e2e = keys.is_some(),
            "Message persisted"
        );

        let envelope = BroadcastEnvelope::new_message(
            persisted.message_id,
            chat_id,
            sender,
            content,
            keys,
            persisted.timestamp,
        );
        self.hub
            .route(envelope)
            .await
            .map_err(|_| ProtocolError::HubClosed)
    }

    async fn handle_read_receipt(&mut self, message_id: MessageId) -> Result<(), ProtocolError> {
        let chat_id = self.connection.chat_id();
        let reader = self.connection.user_id();

        if let Err(e) = self
            .store
            .update_status(chat_id, message_id, reader, DeliveryStatus::Read)
            .await
        {
            warn!(
                message_id = %message_id,
                user_id = %reader,
                "Failed to record read receipt, dropping: {}",
                e
            );
            return Ok(());
        }

        info!(message_id = %message_id, user_id = %reader, "Message read");

        let envelope =
            BroadcastEnvelope::status_update(message_id, chat_id, reader, DeliveryStatus::Read);
        self.hub
            .route(envelope)
            .await
            .map_err(|_| ProtocolError::HubClosed)
    }
}
