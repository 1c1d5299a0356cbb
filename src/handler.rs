//! WebSocket connection handler
//!
//! Handles individual client connections: authenticated handshake, chat
//! membership check, registration with the hub, and the reader/writer task
//! pair of the Connection Actor.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

use crate::auth::{parse_chat_path, TokenVerifier};
use crate::config::Config;
use crate::connection::{Connection, OutboundQueue};
use crate::error::{AppError, AuthError};
use crate::protocol::{ConnectionState, Session};
use crate::server::ServerContext;
use crate::types::{ChatId, UserId};

/// Upper bound on frames coalesced into one flush
const MAX_BATCH: usize = 64;

/// Lower bound on the keep-alive period
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Handle a new TCP connection
///
/// Performs the authenticated WebSocket handshake, admits the client to its
/// chat, and runs the connection until any side closes it.
pub async fn handle_connection(stream: TcpStream, ctx: ServerContext) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut state = ConnectionState::Unauthenticated;

    // WebSocket handshake; the callback authenticates the upgrade request
    let mut admission: Option<Result<(ChatId, UserId), AuthError>> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let result = authorize(request, &ctx.verifier);
        let outcome = match &result {
            Ok(_) => Ok(response),
            Err(e) => Err(rejection(e)),
        };
        admission = Some(result);
        outcome
    };
    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(websocket_config(&ctx.config)),
    )
    .await;

    let mut ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            return Err(match admission {
                Some(Err(reason)) => {
                    info!("Rejected upgrade from {}: {}", peer_addr, reason);
                    AppError::Rejected(reason)
                }
                _ => AppError::WebSocket(e),
            });
        }
    };
    let (chat_id, user_id) = match admission {
        Some(Ok(target)) => target,
        _ => return Err(AuthError::MissingToken.into()),
    };
    state = state.upgrade()?;

    // Only chat participants may subscribe
    let members = match ctx.store.get_members(chat_id).await {
        Ok(members) => members,
        Err(e) => {
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "membership lookup failed".into(),
                }))
                .await;
            return Err(e.into());
        }
    };
    if !members.contains(&user_id) {
        warn!(chat_id = %chat_id, user_id = %user_id, "Upgrade by non-member");
        let _ = ws_stream
            .close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "not a member of this chat".into(),
            }))
            .await;
        return Err(AppError::NotChatMember { user_id, chat_id });
    }

    // Register with the hub
    let (connection, outbound) = Connection::new(user_id, chat_id, ctx.config.outbound_capacity);
    if ctx.hub.register(connection.clone()).await.is_err() {
        error!("Failed to register {} - hub closed", connection.id());
        let _ = ws_stream.close(None).await;
        return Err(AppError::HubClosed);
    }
    state = state.activate()?;

    info!(
        connection = %connection.id(),
        chat_id = %chat_id,
        user_id = %user_id,
        "Client connected from {}",
        peer_addr
    );

    let (ws_sender, ws_receiver) = ws_stream.split();
    let session = Session::new(connection.clone(), state, ctx.store.clone(), ctx.hub.clone());

    let mut read_task = tokio::spawn(read_loop(ws_receiver, session, ctx.config.idle_timeout));
    let mut write_task = tokio::spawn(write_loop(
        ws_sender,
        outbound,
        connection.clone(),
        ctx.config.ping_interval,
    ));

    // Whichever task ends first closes the connection; the other follows
    tokio::select! {
        result = &mut read_task => {
            log_task_end("Read", &connection, result);
            connection.close();
            log_task_end("Write", &connection, write_task.await);
        }
        result = &mut write_task => {
            log_task_end("Write", &connection, result);
            connection.close();
            log_task_end("Read", &connection, read_task.await);
        }
    }

    ctx.hub.unregister(connection.clone());

    info!(connection = %connection.id(), "Client disconnected");

    Ok(())
}

/// Resolve the chat and user of an upgrade request
fn authorize(request: &Request, verifier: &TokenVerifier) -> Result<(ChatId, UserId), AuthError> {
    let chat_id = parse_chat_path(request.uri().path())?;
    let user_id = verifier.authenticate(request.headers())?;
    Ok((chat_id, user_id))
}

/// HTTP response refusing an upgrade
fn rejection(reason: &AuthError) -> ErrorResponse {
    let status = match reason {
        AuthError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        AuthError::MissingToken | AuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
    };
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn websocket_config(config: &Config) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_bytes);
    ws_config.max_frame_size = Some(config.max_message_bytes);
    ws_config
}

fn log_task_end(name: &str, connection: &Connection, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => debug!("{} task ended for {}", name, connection.id()),
        Err(e) => error!("{} task failed for {}: {}", name, connection.id(), e),
    }
}

/// Reader half of the Connection Actor
///
/// Hands each text frame to the session before reading the next one, so a
/// slow command only delays this connection.
async fn read_loop<S>(mut ws_receiver: S, mut session: Session, idle_timeout: Duration)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let id = session.connection().id();

    loop {
        let next = tokio::select! {
            _ = session.connection().closed() => break,
            next = timeout(idle_timeout, ws_receiver.next()) => next,
        };

        match next {
            Err(_) => {
                info!(connection = %id, "Idle timeout, closing connection");
                break;
            }
            Ok(None) => {
                debug!(connection = %id, "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(connection = %id, "WebSocket error: {}", e);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Err(e) = session.handle_text(&text).await {
                    warn!(connection = %id, "Closing connection: {}", e);
                    break;
                }
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                debug!(connection = %id, ?frame, "Client sent close frame");
                break;
            }
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => {
                // Pong replies are queued by tungstenite itself
                trace!(connection = %id, "Keep-alive frame");
            }
            Ok(Some(Ok(_))) => {
                debug!(connection = %id, "Ignoring non-text frame");
            }
        }
    }

    session.close();
    debug!("Read task ended for {}", id);
}

/// Writer half of the Connection Actor
///
/// Drains the outbound queue in order. Everything queued by the time a write
/// starts goes out in one flush.
async fn write_loop<S>(
    mut ws_sender: S,
    mut outbound: OutboundQueue,
    connection: Connection,
    ping_interval: Duration,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let mut ping = interval(ping_interval.max(MIN_PING_INTERVAL));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ping.tick().await;

    let mut batch = Vec::with_capacity(MAX_BATCH);

    loop {
        tokio::select! {
            _ = connection.closed() => break,
            received = outbound.recv_many(&mut batch, MAX_BATCH) => {
                if received == 0 {
                    break;
                }
                if let Err(e) = write_batch(&mut ws_sender, &mut batch).await {
                    debug!("WebSocket send failed for {}: {}", connection.id(), e);
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                    debug!("WebSocket ping failed for {}: {}", connection.id(), e);
                    break;
                }
            }
        }
    }

    connection.close();

    // Send close frame when done
    let _ = ws_sender.close().await;
    debug!("Write task ended for {}", connection.id());
}

/// Feed every queued frame, then flush once
async fn write_batch<S>(ws_sender: &mut S, batch: &mut Vec<String>) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    for frame in batch.drain(..) {
        ws_sender.feed(Message::Text(frame.into())).await?;
    }
    ws_sender.flush().await
}
