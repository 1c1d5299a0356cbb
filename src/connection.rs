//! Connection Actor handle
//!
//! Represents one connected client: its identity, its bounded outbound queue
//! and a close signal shared by its reader and writer tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EnqueueError;
use crate::types::{ChatId, ConnectionId, UserId};

/// Default capacity of the per-connection outbound queue
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Receiving end of a connection's outbound queue, drained by the writer task
pub type OutboundQueue = mpsc::Receiver<String>;

/// Handle to a Connection Actor
///
/// Cheap to clone. The hub keeps one clone in its registry and never mutates
/// it; the reader and writer tasks hold the others.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    /// Hub → writer task frame channel (serialized JSON)
    sender: mpsc::Sender<String>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Create a connection handle and the queue its writer task drains
    pub fn new(user_id: UserId, chat_id: ChatId, capacity: usize) -> (Self, OutboundQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: ConnectionId::new(user_id, chat_id),
            sender,
            shutdown: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.id.user_id
    }

    pub fn chat_id(&self) -> ChatId {
        self.id.chat_id
    }

    /// Enqueue a serialized frame without waiting
    ///
    /// A full queue is reported rather than waited on; the caller decides
    /// whether to evict.
    pub fn send(&self, frame: String) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the connection
    ///
    /// Safe to call from any number of paths concurrently. Returns `true`
    /// only for the call that performed the close.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.shutdown.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed by any path
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}
