//! End-to-end tests against a running server over real sockets.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use ws_echo::{Config, Server, ServerError};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        })
        .await
    }

    async fn start_with(config: Config) -> Self {
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr();
        let (stop, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = rx.await;
        }));
        TestServer { addr, stop, handle }
    }

    async fn connect(&self) -> Client {
        let (ws, _response) = connect_async(format!("ws://{}", self.addr)).await.unwrap();
        ws
    }

    async fn shutdown(self) {
        self.stop.send(()).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

async fn recv(ws: &mut Client) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .unwrap()
}

async fn echo(ws: &mut Client, payload: &str) -> Message {
    ws.send(Message::text(payload)).await.unwrap();
    recv(ws).await
}

/// Upgrade a bare TCP socket by hand so arbitrary frames can be written.
async fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "server closed during upgrade");
        response.push(byte[0]);
    }
    assert!(response.starts_with(b"HTTP/1.1 101"));
    stream
}

/// Read until the server drops the socket, failing if it never does.
async fn assert_dropped(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    let dropped = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                // A close frame may arrive first.
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(dropped.is_ok(), "server kept the connection open");
}

#[tokio::test]
async fn test_hello_then_disconnect() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    assert_eq!(echo(&mut ws, "hello").await, Message::text("You said: hello"));

    ws.close(None).await.unwrap();
    // Only the close handshake is left on the stream.
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Close(_)) => {}
            Ok(other) => panic!("unexpected frame after close: {:?}", other),
            Err(_) => break,
        }
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_payload() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    assert_eq!(echo(&mut ws, "").await, Message::text("You said: "));

    server.shutdown().await;
}

#[tokio::test]
async fn test_payloads_are_echoed_unchanged() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    for payload in ["\0\u{7}\r\n\t", "héllo wörld ✓", "{\"type\":\"x\"}", " "] {
        assert_eq!(
            echo(&mut ws, payload).await,
            Message::text(format!("You said: {payload}"))
        );
    }

    let large = "x".repeat(256 * 1024);
    assert_eq!(
        echo(&mut ws, &large).await,
        Message::text(format!("You said: {large}"))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_replies_keep_send_order() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    ws.send(Message::text("first")).await.unwrap();
    ws.send(Message::text("second")).await.unwrap();

    assert_eq!(recv(&mut ws).await, Message::text("You said: first"));
    assert_eq!(recv(&mut ws).await, Message::text("You said: second"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_connections_are_independent() {
    let server = TestServer::start().await;

    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(server.connect().await);
    }

    for (i, ws) in clients.iter_mut().enumerate() {
        ws.send(Message::text(format!("client {i}"))).await.unwrap();
    }
    for (i, ws) in clients.iter_mut().enumerate() {
        assert_eq!(recv(ws).await, Message::text(format!("You said: client {i}")));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_closing_one_client_leaves_others_working() {
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    assert_eq!(echo(&mut a, "from a").await, Message::text("You said: from a"));
    a.close(None).await.unwrap();
    drop(a);

    assert_eq!(echo(&mut b, "from b").await, Message::text("You said: from b"));

    // An abrupt drop without a close frame is also isolated.
    let c = server.connect().await;
    drop(c);
    assert_eq!(echo(&mut b, "again").await, Message::text("You said: again"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_binary_frame_answered_as_text() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    ws.send(Message::binary(b"raw bytes".to_vec())).await.unwrap();
    assert_eq!(recv(&mut ws).await, Message::text("You said: raw bytes"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_answered_by_websocket_layer() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    ws.send(Message::Ping(b"probe".to_vec())).await.unwrap();
    assert_eq!(recv(&mut ws).await, Message::Pong(b"probe".to_vec()));

    // No echo reply is generated for the ping itself.
    assert_eq!(echo(&mut ws, "after").await, Message::text("You said: after"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_clients() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;
    assert_eq!(echo(&mut ws, "hi").await, Message::text("You said: hi"));

    let TestServer { stop, handle, .. } = server;
    stop.send(()).unwrap();

    match recv(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {:?}", other),
    }
    // Reading on lets the client answer the close so the server can finish.
    while let Some(Ok(_)) = ws.next().await {}

    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_cap_holds_extra_clients() {
    let server = TestServer::start_with(Config {
        listen: "127.0.0.1:0".to_string(),
        max_connections: 1,
        ..Config::default()
    })
    .await;

    let mut first = server.connect().await;
    assert_eq!(echo(&mut first, "one").await, Message::text("You said: one"));

    let url = format!("ws://{}", server.addr);
    let waiting = tokio::spawn(async move { connect_async(url).await.unwrap().0 });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiting.is_finished());

    first.close(None).await.unwrap();
    while let Some(Ok(_)) = first.next().await {}

    let mut second = tokio::time::timeout(RECV_TIMEOUT, waiting)
        .await
        .expect("second client never admitted")
        .unwrap();
    assert_eq!(echo(&mut second, "two").await, Message::text("You said: two"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_text_frame_drops_only_that_client() {
    let server = TestServer::start().await;
    let mut other = server.connect().await;

    let mut raw = raw_upgrade(server.addr).await;
    // FIN + text, masked with a zero key, payload 0xff 0xfe.
    raw.write_all(&[0x81, 0x82, 0, 0, 0, 0, 0xff, 0xfe])
        .await
        .unwrap();
    assert_dropped(&mut raw).await;

    assert_eq!(echo(&mut other, "ok").await, Message::text("You said: ok"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_message_drops_only_that_client() {
    let server = TestServer::start_with(Config {
        listen: "127.0.0.1:0".to_string(),
        max_message_size: 16,
        ..Config::default()
    })
    .await;
    let mut other = server.connect().await;
    let mut big = server.connect().await;

    big.send(Message::text("x".repeat(64))).await.unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(frame) = big.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(unexpected) => panic!("unexpected reply to oversized message: {:?}", unexpected),
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "oversized client was not dropped");

    assert_eq!(echo(&mut other, "ok").await, Message::text("You said: ok"));

    server.shutdown().await;
}
