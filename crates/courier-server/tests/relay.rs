//! End-to-end tests over real sockets.

use courier_protocol::{codec, decode_server, MessageKind, ServerEnvelope};
use courier_server::auth::{StaticTokens, TokenEntry, TokenKind};
use courier_server::config::{AuthConfig, Config, MetricsConfig};
use courier_server::handlers::{self, AppState};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn token(token: &str, user: &str, device: &str, kind: TokenKind) -> TokenEntry {
    TokenEntry {
        token: token.into(),
        user_id: user.into(),
        device_id: device.into(),
        kind,
    }
}

async fn start_server() -> SocketAddr {
    let tokens = vec![
        token("t-u1", "u1", "d1", TokenKind::Access),
        token("t-u2", "u2", "d1", TokenKind::Access),
        token("t-u3", "u3", "d1", TokenKind::Access),
        token("r-u1", "u1", "d1", TokenKind::Refresh),
    ];
    let config = Config {
        auth: AuthConfig {
            tokens: tokens.clone(),
        },
        metrics: MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        },
        ..Config::default()
    };
    let state = AppState::new(config, Arc::new(StaticTokens::new(&tokens)))
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(handlers::serve(listener, Arc::new(state)));
    addr
}

async fn connect(addr: SocketAddr, token: &str) -> Socket {
    let (mut socket, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .unwrap();
    let welcome = next_frame(&mut socket).await;
    assert_eq!(welcome.kind, MessageKind::Status);
    socket
}

async fn next_frame(socket: &mut Socket) -> ServerEnvelope {
    loop {
        let message = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match message {
            Message::Text(text) => return decode_server(text.as_bytes()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn send(socket: &mut Socket, json: &str) {
    socket.send(Message::Text(json.to_string())).await.unwrap();
}

async fn http_get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    timeout(WAIT, stream.read_to_string(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let status = raw[9..12].parse().unwrap();
    let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default();
    (status, serde_json::from_str(body).unwrap_or(serde_json::Value::Null))
}

#[tokio::test]
async fn test_health() {
    let addr = start_server().await;
    let (status, body) = http_get(addr, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_rejects_bad_tokens() {
    let addr = start_server().await;

    for url in [
        format!("ws://{addr}/ws"),
        format!("ws://{addr}/ws?token=bogus"),
        format!("ws://{addr}/ws?token=r-u1"),
    ] {
        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            Err(e) => panic!("expected 401, got {e}"),
            Ok(_) => panic!("expected 401, connection was accepted"),
        }
    }

    let (status, body) = http_get(addr, "/stats").await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "Missing authentication token");
}

#[tokio::test]
async fn test_message_relay_and_stats() {
    let addr = start_server().await;
    let mut u1 = connect(addr, "t-u1").await;
    let mut u2 = connect(addr, "t-u2").await;

    send(&mut u2, r#"{"type":"message","to":"u1","payload":"Zm9v"}"#).await;

    let relayed = next_frame(&mut u1).await;
    assert_eq!(relayed.kind, MessageKind::Message);
    assert_eq!(relayed.from, "u2");
    assert_eq!(relayed.payload, "Zm9v");

    let ack = next_frame(&mut u2).await;
    assert_eq!(ack.kind, MessageKind::Delivery);
    assert_eq!(ack.message_id, relayed.message_id);

    // Stats are updated by the hub task right after fan-out.
    let mut stats = serde_json::Value::Null;
    for _ in 0..20 {
        let (status, body) = http_get(addr, "/stats?token=t-u1").await;
        assert_eq!(status, 200);
        stats = body;
        if stats["websocket"]["messages_relayed"] == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stats["websocket"]["messages_relayed"], 1);
    assert_eq!(stats["websocket"]["active_connections"], 2);
    assert_eq!(stats["users"]["online_count"], 2);
}

#[tokio::test]
async fn test_offline_delivery() {
    let addr = start_server().await;
    let mut u2 = connect(addr, "t-u2").await;

    send(&mut u2, r#"{"type":"message","to":"u3","payload":"M1"}"#).await;
    assert_eq!(next_frame(&mut u2).await.kind, MessageKind::Delivery);

    let mut u3 = connect(addr, "t-u3").await;
    let replayed = next_frame(&mut u3).await;
    assert_eq!(replayed.kind, MessageKind::Message);
    assert_eq!(replayed.from, "u2");
    assert_eq!(replayed.payload, "M1");
}

#[tokio::test]
async fn test_protocol_errors_keep_connection() {
    let addr = start_server().await;
    let mut u1 = connect(addr, "t-u1").await;

    send(&mut u1, "not json").await;
    let frame = next_frame(&mut u1).await;
    assert_eq!(frame.kind, MessageKind::Error);
    assert_eq!(codec::decode_error_body(&frame).unwrap().code, "PARSE_ERROR");

    send(&mut u1, r#"{"type":"message","payload":"x"}"#).await;
    let frame = next_frame(&mut u1).await;
    assert_eq!(codec::decode_error_body(&frame).unwrap().code, "MISSING_RECIPIENT");

    send(&mut u1, r#"{"type":"ping"}"#).await;
    assert_eq!(next_frame(&mut u1).await.kind, MessageKind::Pong);
}
