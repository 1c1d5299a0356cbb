//! Real-time fan-out hub for end-to-end encrypted chat
//!
//! Routes pre-encrypted chat messages between WebSocket clients, tracks
//! per-recipient delivery/read status, and only forwards ciphertext to
//! recipients for whom the sender supplied an encrypted key.
//!
//! # Features
//! - Token-authenticated WebSocket upgrade on `/ws/{chat_id}`
//! - `new_message` fan-out with per-recipient key filtering
//! - `read_receipt` handling with `status_update` broadcasts
//! - Bounded per-connection queues; slow clients are evicted
//! - Keep-alive pings, idle timeout and graceful shutdown
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the single task owning chat membership and doing fan-out
//! - Each connection has a reader task and a writer task
//! - No locks needed - all membership access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_hub::{serve, Config, Hub, InMemoryStore, ServerContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().unwrap();
//!     let listener = TcpListener::bind(&config.bind_addr).await.unwrap();
//!     let (hub, handle) = Hub::new(config.channel_capacity);
//!
//!     tokio::spawn(hub.run());
//!
//!     let ctx = ServerContext::new(handle, Arc::new(InMemoryStore::new()), config);
//!     serve(listener, ctx, async { let _ = tokio::signal::ctrl_c().await; }).await;
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod membership;
pub mod message;
pub mod protocol;
pub mod server;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use auth::{Claims, TokenVerifier};
pub use config::Config;
pub use connection::Connection;
pub use error::{AppError, AuthError, ConfigError, EnqueueError, ProtocolError, StoreError};
pub use handler::handle_connection;
pub use hub::{Hub, HubClosed, HubHandle};
pub use message::{BroadcastEnvelope, DeliveryStatus, Frame, FrameType, InboundCommand};
pub use protocol::{ConnectionState, Session};
pub use server::{serve, ServerContext};
pub use store::{InMemoryStore, MessageStore, PersistedMessage};
pub use types::{ChatId, ConnectionId, KeyMap, MessageId, UserId};
