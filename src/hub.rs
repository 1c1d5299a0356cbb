//! Hub actor: Membership Registry + Fan-Out Router
//!
//! The single serialization point that owns chat membership and performs
//! fan-out. Uses the Actor pattern with mpsc channels for message passing;
//! no locks guard the registry because only this task touches it.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::EnqueueError;
use crate::membership::Registry;
use crate::message::BroadcastEnvelope;
use crate::types::ChatId;

/// Default buffer size of the register, broadcast and query channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Registration request, acknowledged once the connection is in the registry
#[derive(Debug)]
struct Registration {
    connection: Connection,
    ack: oneshot::Sender<()>,
}

/// Read-only questions about the registry
#[derive(Debug)]
enum Query {
    SubscriberCount {
        chat_id: ChatId,
        reply: oneshot::Sender<usize>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Outcome of fanning out one envelope
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    /// Frames enqueued
    pub delivered: usize,
    /// Subscribers skipped for lack of a key entry
    pub skipped: usize,
    /// Subscribers evicted because their queue was full or closed
    pub evicted: usize,
}

/// Cloneable handle used by connections to talk to the hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::UnboundedSender<Connection>,
    broadcast_tx: mpsc::Sender<BroadcastEnvelope>,
    query_tx: mpsc::Sender<Query>,
    shutdown: CancellationToken,
}

impl HubHandle {
    /// Register an active connection
    ///
    /// Returns once the hub has applied the registration, so frames routed
    /// afterwards reach this connection. Registering twice is a no-op.
    pub async fn register(&self, connection: Connection) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.register_tx
            .send(Registration { connection, ack })
            .await
            .map_err(|_| HubClosed)?;
        done.await.map_err(|_| HubClosed)
    }

    /// Unregister a connection and close it
    ///
    /// Never blocks; safe to call from any teardown path, including after
    /// the hub already evicted the connection.
    pub fn unregister(&self, connection: Connection) {
        if let Err(mpsc::error::SendError(connection)) = self.unregister_tx.send(connection) {
            // Hub is gone; still release the connection
            connection.close();
        }
    }

    /// Submit an envelope for fan-out
    pub async fn route(&self, envelope: BroadcastEnvelope) -> Result<(), HubClosed> {
        self.broadcast_tx.send(envelope).await.map_err(|_| HubClosed)
    }

    /// Number of connections currently subscribed to a chat
    pub async fn subscriber_count(&self, chat_id: ChatId) -> Result<usize, HubClosed> {
        let (reply, answer) = oneshot::channel();
        self.query_tx
            .send(Query::SubscriberCount { chat_id, reply })
            .await
            .map_err(|_| HubClosed)?;
        answer.await.map_err(|_| HubClosed)
    }

    /// Number of connections registered across all chats
    pub async fn connection_count(&self) -> Result<usize, HubClosed> {
        let (reply, answer) = oneshot::channel();
        self.query_tx
            .send(Query::ConnectionCount { reply })
            .await
            .map_err(|_| HubClosed)?;
        answer.await.map_err(|_| HubClosed)
    }

    /// Stop the hub, closing every registered connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// The hub task stopped before the request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Hub is not running")]
pub struct HubClosed;

/// The hub actor
///
/// Consumes register, unregister, broadcast and query channels. Ready
/// channels are picked at random by `select!`, so a steady broadcast load
/// cannot starve unregistration.
pub struct Hub {
    registry: Registry,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<Connection>,
    broadcast_rx: mpsc::Receiver<BroadcastEnvelope>,
    query_rx: mpsc::Receiver<Query>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Create a hub and the handle used to reach it
    pub fn new(channel_capacity: usize) -> (Self, HubHandle) {
        let capacity = channel_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();

        let hub = Self {
            registry: Registry::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            query_rx,
            shutdown: shutdown.clone(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            query_tx,
            shutdown,
        };
        (hub, handle)
    }

    /// Run the hub event loop
    ///
    /// Runs until shutdown is requested or every handle is dropped, then
    /// closes all remaining connections.
    pub async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Hub shutdown requested");
                    break;
                }
                registration = self.register_rx.recv() => match registration {
                    Some(registration) => self.handle_register(registration),
                    None => break,
                },
                connection = self.unregister_rx.recv() => match connection {
                    Some(connection) => self.handle_unregister(connection),
                    None => break,
                },
                envelope = self.broadcast_rx.recv() => match envelope {
                    Some(envelope) => {
                        self.route(envelope);
                    }
                    None => break,
                },
                query = self.query_rx.recv() => match query {
                    Some(query) => self.handle_query(query),
                    None => break,
                },
            }
        }

        let remaining = self.registry.drain();
        for connection in &remaining {
            connection.close();
        }
        info!(closed = remaining.len(), "Hub shutting down");
    }

    fn handle_register(&mut self, registration: Registration) {
        let Registration { connection, ack } = registration;
        let id = connection.id();

        if connection.is_closed() {
            // Closed while the request was queued; never make it visible
            debug!(connection = %id, "Skipping registration of closed connection");
        } else if self.registry.insert(connection) {
            info!(
                connection = %id,
                chat_id = %id.chat_id,
                user_id = %id.user_id,
                subscribers = self.registry.subscriber_count(id.chat_id),
                "Connection registered"
            );
        } else {
            debug!(connection = %id, "Connection already registered");
        }

        let _ = ack.send(());
    }

    fn handle_unregister(&mut self, connection: Connection) {
        let id = connection.id();
        if self.registry.remove(&id).is_some() {
            info!(
                connection = %id,
                chat_id = %id.chat_id,
                connections = self.registry.connection_count(),
                "Connection unregistered"
            );
        } else {
            debug!(connection = %id, "Unregister for absent connection");
        }
        connection.close();
    }

    fn handle_query(&self, query: Query) {
        match query {
            Query::SubscriberCount { chat_id, reply } => {
                let _ = reply.send(self.registry.subscriber_count(chat_id));
            }
            Query::ConnectionCount { reply } => {
                let _ = reply.send(self.registry.connection_count());
            }
        }
    }

    /// Fan one envelope out to the chat's subscribers
    ///
    /// Never awaits: every frame is `try_send`ed, and a subscriber whose
    /// queue rejects it is evicted in the same step.
    fn route(&mut self, envelope: BroadcastEnvelope) -> RouteStats {
        let mut stats = RouteStats::default();
        let mut evicted = Vec::new();

        for connection in self.registry.subscribers(envelope.chat_id) {
            let Some(frame) = envelope.frame_for(connection.user_id()) else {
                stats.skipped += 1;
                continue;
            };

            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(message_id = %envelope.message_id, "Failed to serialize frame: {}", e);
                    continue;
                }
            };

            match connection.send(payload) {
                Ok(()) => stats.delivered += 1,
                Err(reason) => evicted.push((connection.id(), reason)),
            }
        }

        for (id, reason) in evicted {
            if let Some(connection) = self.registry.remove(&id) {
                match reason {
                    EnqueueError::QueueFull => warn!(
                        connection = %id,
                        chat_id = %id.chat_id,
                        "Outbound queue full, evicting connection"
                    ),
                    EnqueueError::Closed => debug!(
                        connection = %id,
                        "Dropping closed connection"
                    ),
                }
                connection.close();
                stats.evicted += 1;
            }
        }

        debug!(
            message_id = %envelope.message_id,
            chat_id = %envelope.chat_id,
            delivered = stats.delivered,
            skipped = stats.skipped,
            evicted = stats.evicted,
            "Envelope routed"
        );
        stats
    }
}
