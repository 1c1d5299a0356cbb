//! End-to-end flow over real WebSocket connections

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_hub::{
    serve, ChatId, Claims, Config, DeliveryStatus, Frame, FrameType, Hub, HubHandle,
    InMemoryStore, KeyMap, ServerContext, UserId,
};

const SECRET: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(300);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    url: String,
    hub: HubHandle,
    chat: ChatId,
    store: Arc<InMemoryStore>,
}

async fn start_server() -> TestServer {
    let store = Arc::new(InMemoryStore::new());
    let chat = ChatId::new();
    store.create_chat(chat, [UserId(1), UserId(2)]).await;

    let config = Config {
        jwt_secret: SECRET.to_string(),
        ..Config::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (hub, handle) = Hub::new(config.channel_capacity);
    tokio::spawn(hub.run());

    let ctx = ServerContext::new(handle.clone(), store.clone(), config);
    tokio::spawn(serve(listener, ctx, std::future::pending::<()>()));

    TestServer {
        url: format!("ws://{}", addr),
        hub: handle,
        chat,
        store,
    }
}

fn token(user_id: i64) -> String {
    let claims = Claims {
        user_id,
        exp: (chrono::Utc::now().timestamp() + 900) as u64,
        sub: Some(user_id.to_string()),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn try_connect(server: &TestServer, user_id: Option<i64>) -> Result<Client, WsError> {
    let mut request = format!("{}/ws/{}", server.url, server.chat)
        .into_client_request()
        .unwrap();
    if let Some(user_id) = user_id {
        let cookie = format!("UserToken={}", token(user_id));
        request
            .headers_mut()
            .insert("Cookie", HeaderValue::from_str(&cookie).unwrap());
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn connect(server: &TestServer, user_id: i64) -> Client {
    try_connect(server, Some(user_id)).await.unwrap()
}

async fn wait_for_subscribers(server: &TestServer, expected: usize) {
    timeout(WAIT, async {
        while server.hub.subscriber_count(server.chat).await.unwrap() != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

async fn next_text(ws: &mut Client) -> String {
    let deadline = Instant::now() + WAIT;
    loop {
        let message = timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

async fn next_frame(ws: &mut Client) -> Frame {
    serde_json::from_str(&next_text(ws).await).unwrap()
}

async fn expect_silence(ws: &mut Client) {
    assert!(
        timeout(QUIET, ws.next()).await.is_err(),
        "unexpected frame"
    );
}

/// Waits for the server to end the connection
async fn expect_closed(ws: &mut Client) {
    let deadline = Instant::now() + WAIT;
    loop {
        match timeout_at(deadline, ws.next()).await.expect("connection stayed open") {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    }
}

async fn send(ws: &mut Client, json: &str) {
    ws.send(Message::Text(json.to_string().into())).await.unwrap();
}

fn keys(entries: &[(i64, &str)]) -> KeyMap {
    entries
        .iter()
        .map(|(user, key)| (UserId(*user), key.to_string()))
        .collect()
}

#[tokio::test]
async fn test_message_and_read_receipt_flow() {
    let server = start_server().await;
    let mut alice = connect(&server, 1).await;
    let mut bob = connect(&server, 2).await;
    wait_for_subscribers(&server, 2).await;

    send(
        &mut alice,
        r#"{"type":"new_message","content":"ciphertext","keys":{"1":"k1","2":"k2"}}"#,
    )
    .await;

    let to_alice = next_frame(&mut alice).await;
    assert_eq!(to_alice.frame_type, FrameType::NewMessage);
    assert_eq!(to_alice.status, Some(DeliveryStatus::Read));
    assert_eq!(to_alice.keys, Some(keys(&[(1, "k1")])));
    assert_eq!(to_alice.user_id, UserId(1));

    let to_bob = next_frame(&mut bob).await;
    assert_eq!(to_bob.status, Some(DeliveryStatus::Delivered));
    assert_eq!(to_bob.keys, Some(keys(&[(2, "k2")])));
    assert_eq!(to_bob.content.as_deref(), Some("ciphertext"));
    assert_eq!(to_bob.id, to_alice.id);

    let message_id = to_bob.id.unwrap();
    send(
        &mut bob,
        &format!(r#"{{"type":"read_receipt","message_id":{}}}"#, message_id),
    )
    .await;

    for ws in [&mut alice, &mut bob] {
        let raw = next_text(ws).await;
        assert!(!raw.contains("\"content\""));
        let frame: Frame = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame.frame_type, FrameType::StatusUpdate);
        assert_eq!(frame.status, Some(DeliveryStatus::Read));
        assert_eq!(frame.message_id, Some(message_id));
    }

    assert_eq!(
        server.store.status_of(message_id, UserId(2)).await,
        Some(DeliveryStatus::Read)
    );
}

#[tokio::test]
async fn test_recipient_without_key_receives_nothing() {
    let server = start_server().await;
    let mut alice = connect(&server, 1).await;
    let mut bob = connect(&server, 2).await;
    wait_for_subscribers(&server, 2).await;

    send(
        &mut alice,
        r#"{"type":"new_message","content":"ciphertext","keys":{"1":"k1"}}"#,
    )
    .await;

    let to_alice = next_frame(&mut alice).await;
    assert_eq!(to_alice.keys, Some(keys(&[(1, "k1")])));
    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn test_unknown_command_keeps_connection_open() {
    let server = start_server().await;
    let mut alice = connect(&server, 1).await;
    let mut bob = connect(&server, 2).await;
    wait_for_subscribers(&server, 2).await;

    send(&mut alice, r#"{"type":"typing"}"#).await;
    send(&mut alice, r#"{"type":"read_receipt"}"#).await;
    send(&mut alice, r#"{"type":"new_message","content":"plain"}"#).await;

    let to_bob = next_frame(&mut bob).await;
    assert_eq!(to_bob.content.as_deref(), Some("plain"));
    assert!(to_bob.keys.is_none());
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let server = start_server().await;
    let mut alice = connect(&server, 1).await;
    let mut bob = connect(&server, 2).await;
    wait_for_subscribers(&server, 2).await;

    send(&mut alice, "this is not json").await;
    expect_closed(&mut alice).await;
    wait_for_subscribers(&server, 1).await;

    // Bob keeps working on his own
    send(&mut bob, r#"{"type":"new_message","content":"still here"}"#).await;
    assert_eq!(
        next_frame(&mut bob).await.content.as_deref(),
        Some("still here")
    );
}

#[tokio::test]
async fn test_client_disconnect_unregisters() {
    let server = start_server().await;
    let _alice = connect(&server, 1).await;
    let mut bob = connect(&server, 2).await;
    wait_for_subscribers(&server, 2).await;

    bob.close(None).await.unwrap();
    wait_for_subscribers(&server, 1).await;
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let server = start_server().await;

    match try_connect(&server, None).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("upgrade without token succeeded"),
    }
    assert_eq!(server.hub.subscriber_count(server.chat).await.unwrap(), 0);
}

#[tokio::test]
async fn test_non_member_is_refused() {
    let server = start_server().await;
    let mut mallory = connect(&server, 3).await;

    let message = timeout(WAIT, mallory.next())
        .await
        .expect("no close frame")
        .expect("stream ended")
        .unwrap();
    match message {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close frame, got {:?}", other),
    }
    assert_eq!(server.hub.subscriber_count(server.chat).await.unwrap(), 0);
}

#[tokio::test]
async fn test_hub_shutdown_closes_clients() {
    let server = start_server().await;
    let mut alice = connect(&server, 1).await;
    let mut bob = connect(&server, 2).await;
    wait_for_subscribers(&server, 2).await;

    server.hub.shutdown();

    expect_closed(&mut alice).await;
    expect_closed(&mut bob).await;
}
