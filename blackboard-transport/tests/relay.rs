//! End-to-end behavior of the relay over real WebSocket connections.

use std::net::SocketAddr;
use std::time::Duration;

use blackboard_config::Config;
use blackboard_core::ConnectionRegistry;
use blackboard_transport::RelayServer;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

struct TestRelay {
    addr: SocketAddr,
    registry: ConnectionRegistry,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestRelay {
    async fn start() -> Self {
        Self::start_with(Config::default()).await
    }

    async fn start_with(mut config: Config) -> Self {
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        let server = RelayServer::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            registry,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn connect(&self) -> Client {
        self.connect_path("/ws").await.unwrap()
    }

    async fn connect_path(&self, path: &str) -> Result<Client, WsError> {
        let before = self.registry.len();
        let (client, _response) = connect_async(format!("ws://{}{}", self.addr, path)).await?;
        // The server registers the connection right after the handshake.
        self.wait_for_clients(before + 1).await;
        Ok(client)
    }

    async fn wait_for_clients(&self, expected: usize) {
        let deadline = Instant::now() + WAIT;
        while self.registry.len() != expected {
            assert!(
                Instant::now() < deadline,
                "expected {} clients, registry has {}",
                expected,
                self.registry.len()
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(WAIT, self.task).await.unwrap().unwrap();
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame, parsed; skips control frames.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Asserts that no data frame arrives for a short while.
async fn assert_silent(client: &mut Client) {
    match timeout(QUIET, client.next()).await {
        Err(_) => {}
        Ok(frame) => panic!("expected no message, got {:?}", frame),
    }
}

/// Reads until the server closes the stream.
async fn expect_closed(client: &mut Client) {
    let result = timeout(WAIT, async {
        while let Some(frame) = client.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "server did not close the connection");
}

#[tokio::test]
async fn concurrent_clients_are_all_registered() {
    let relay = TestRelay::start().await;
    let addr = relay.addr;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            tokio::spawn(async move { connect_async(format!("ws://{}/ws", addr)).await.unwrap().0 })
        })
        .collect();
    let mut clients = Vec::new();
    for handle in handles {
        clients.push(handle.await.unwrap());
    }

    relay.wait_for_clients(10).await;
    drop(clients);
    relay.wait_for_clients(0).await;
    relay.stop().await;
}

#[tokio::test]
async fn chat_reaches_every_client_once_including_sender() {
    let relay = TestRelay::start().await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;
    let mut c = relay.connect().await;

    send_json(&mut a, json!({"type": "chat", "data": "hi"})).await;

    for client in [&mut a, &mut b, &mut c] {
        assert_eq!(next_json(client).await, json!({"type": "chat", "data": "hi"}));
    }
    for client in [&mut a, &mut b, &mut c] {
        assert_silent(client).await;
    }
    relay.stop().await;
}

#[tokio::test]
async fn unclean_disconnect_is_removed_and_others_keep_receiving() {
    let relay = TestRelay::start().await;
    let mut a = relay.connect().await;
    let b = relay.connect().await;
    let mut c = relay.connect().await;

    // Dropping the client tears down TCP without a close handshake.
    drop(b);
    relay.wait_for_clients(2).await;

    send_json(&mut a, json!({"type": "draw", "data": {"startX": 1, "endX": 2}})).await;
    let expected = json!({"type": "draw", "data": {"startX": 1, "endX": 2}});
    assert_eq!(next_json(&mut c).await, expected);
    assert_eq!(next_json(&mut a).await, expected);
    assert_eq!(relay.registry.len(), 2);
    relay.stop().await;
}

#[tokio::test]
async fn undecodable_frame_closes_only_that_client() {
    let relay = TestRelay::start().await;
    let mut a = relay.connect().await;
    let mut bad = relay.connect().await;

    bad.send(Message::Text("this is not json".to_string())).await.unwrap();
    expect_closed(&mut bad).await;
    relay.wait_for_clients(1).await;

    send_json(&mut a, json!({"type": "clear", "data": {}})).await;
    assert_eq!(next_json(&mut a).await, json!({"type": "clear", "data": {}}));
    relay.stop().await;
}

#[tokio::test]
async fn messages_from_one_client_keep_their_order() {
    let relay = TestRelay::start().await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    for n in 0..20 {
        send_json(&mut a, json!({"type": "draw", "data": n})).await;
    }
    for n in 0..20 {
        assert_eq!(next_json(&mut b).await, json!({"type": "draw", "data": n}));
    }
    relay.stop().await;
}

#[tokio::test]
async fn binary_json_frames_are_relayed_as_text() {
    let relay = TestRelay::start().await;
    let mut a = relay.connect().await;

    a.send(Message::Binary(br#"{"type":"clear"}"#.to_vec())).await.unwrap();
    assert_eq!(next_json(&mut a).await, json!({"type": "clear", "data": null}));
    relay.stop().await;
}

#[tokio::test]
async fn other_paths_are_rejected_without_registration() {
    let relay = TestRelay::start().await;

    let result = connect_async(format!("ws://{}/not-here", relay.addr)).await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP 404, got {:?}", other.map(|_| ())),
    }
    assert!(relay.registry.is_empty());

    // The server keeps serving after a failed handshake.
    let mut a = relay.connect().await;
    send_json(&mut a, json!({"type": "chat", "data": "still here"})).await;
    assert_eq!(next_json(&mut a).await["data"], "still here");
    relay.stop().await;
}

/// Sends a raw HTTP request and returns everything the server writes back
/// before closing the socket.
async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .expect("server kept the socket open")
        .unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn non_upgrade_requests_get_an_http_error() {
    let relay = TestRelay::start().await;

    let response = raw_request(relay.addr, "GET /ws HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    let response = raw_request(relay.addr, "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", response);

    let stale = "GET /ws HTTP/1.1\r\n\
        Host: localhost\r\n\
        Connection: Upgrade\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Version: 8\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    let response = raw_request(relay.addr, stale).await;
    assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "{}", response);
    assert!(response.contains("Sec-WebSocket-Version: 13\r\n"));

    assert!(relay.registry.is_empty());
    let mut a = relay.connect().await;
    send_json(&mut a, json!({"type": "chat", "data": "after"})).await;
    assert_eq!(next_json(&mut a).await["data"], "after");
    relay.stop().await;
}

#[tokio::test]
async fn exclude_sender_policy_skips_the_origin() {
    let mut config = Config::default();
    config.relay.echo_to_sender = false;
    let relay = TestRelay::start_with(config).await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    send_json(&mut a, json!({"type": "chat", "data": "hi"})).await;
    assert_eq!(next_json(&mut b).await, json!({"type": "chat", "data": "hi"}));
    assert_silent(&mut a).await;
    relay.stop().await;
}

#[tokio::test]
async fn oversized_message_is_a_read_failure() {
    let mut config = Config::default();
    config.relay.max_message_size = Some(64);
    config.relay.max_frame_size = Some(64);
    let relay = TestRelay::start_with(config).await;
    let mut a = relay.connect().await;
    let mut big = relay.connect().await;

    let payload = "x".repeat(256);
    let _ = big.send(Message::Text(json!({"type": "chat", "data": payload}).to_string())).await;
    expect_closed(&mut big).await;
    relay.wait_for_clients(1).await;

    send_json(&mut a, json!({"type": "chat", "data": "ok"})).await;
    assert_eq!(next_json(&mut a).await["data"], "ok");
    relay.stop().await;
}

#[tokio::test]
async fn shutdown_closes_every_client() {
    let relay = TestRelay::start().await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;
    let registry = relay.registry.clone();

    relay.stop().await;

    assert!(registry.is_empty());
    expect_closed(&mut a).await;
    expect_closed(&mut b).await;
}
