// Message framing corner cases, end to end through the proxy

mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use common::*;
use sidegate::Config;

/// Origin that serves one connection: reads until `until` is seen, checks
/// the request with `check`, then writes `reply` and closes
async fn scripted_origin(
    until: &'static [u8],
    reply: &'static [u8],
) -> (u16, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        while find(&buf, until).is_none() {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
        stream.write_all(reply).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    });
    (port, task)
}

async fn read_until(stream: &mut TcpStream, marker: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while find(&buf, marker).is_none() {
        let n = tokio::time::timeout(std::time::Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "closed before {:?}", String::from_utf8_lossy(marker));
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

#[tokio::test]
async fn test_oversized_header_gets_413() {
    let config = Config {
        max_header_size: 512,
        ..test_config()
    };
    let proxy = TestProxy::start(config).await;
    let mut client = proxy.client().await;

    let request = format!(
        "GET http://origin.test/ HTTP/1.1\r\nX-Padding: {}\r\n\r\n",
        "a".repeat(1000)
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 413);
    assert!(is_closed(&mut client).await);
}

#[tokio::test]
async fn test_slow_header_gets_408() {
    let config = Config {
        read_timeout_seconds: 1,
        ..test_config()
    };
    let proxy = TestProxy::start(config).await;
    let mut client = proxy.client().await;

    client
        .write_all(b"GET http://origin.test/ HTTP/1.1\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 408);
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let (origin, accepted) =
        spawn_origin("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!("HEAD http://origin.test:{}/ HTTP/1.1\r\n\r\n", origin);
    for _ in 0..2 {
        client.write_all(request.as_bytes()).await.unwrap();
        let head = read_until(&mut client, b"\r\n\r\n").await;
        let head = String::from_utf8_lossy(&head).into_owned();
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
        assert!(head.ends_with("\r\n\r\n"), "body leaked: {:?}", head);
    }
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unframed_response_closes_client() {
    let (origin, _) = scripted_origin(b"\r\n\r\n", b"HTTP/1.1 200 OK\r\n\r\nstreamed").await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!("GET http://origin.test:{}/ HTTP/1.1\r\n\r\n", origin);
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("Connection").as_deref(), Some("close"));
    assert_eq!(response.body_text(), "streamed");
}

#[tokio::test]
async fn test_expect_continue_answered_by_proxy() {
    let (origin, seen) = scripted_origin(
        b"data",
        b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!(
        "PUT http://origin.test:{}/item HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
        origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let interim = read_until(&mut client, b"\r\n\r\n").await;
    assert!(String::from_utf8_lossy(&interim).starts_with("HTTP/1.1 100 Continue"));

    client.write_all(b"data").await.unwrap();
    assert_eq!(read_response(&mut client).await.status, 201);

    let seen = seen.await.unwrap();
    assert!(!seen.to_ascii_lowercase().contains("expect:"), "{}", seen);
}

#[tokio::test]
async fn test_expect_continue_is_not_sent_to_http10_client() {
    let (origin, _) = scripted_origin(
        b"data",
        b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!(
        "PUT http://origin.test:{}/item HTTP/1.0\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\ndata",
        origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 201);
    assert!(!response.head.contains("100 Continue"), "{}", response.head);
}

#[tokio::test]
async fn test_truncated_request_body_gets_400() {
    let (origin, _) = scripted_origin(
        b"abcd",
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!(
        "POST http://origin.test:{}/upload HTTP/1.1\r\nContent-Length: 10\r\n\r\nabcd",
        origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    let response = read_response(&mut client).await;
    assert_eq!(response.status, 400);
    assert!(response.body_text().contains("4 of 10 bytes"));
}

#[tokio::test]
async fn test_provisional_response_is_relayed() {
    let (origin, _) = scripted_origin(
        b"\r\n\r\n",
        b"HTTP/1.1 103 Early Hints\r\nLink: </style.css>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!("GET http://origin.test:{}/ HTTP/1.1\r\n\r\n", origin);
    client.write_all(request.as_bytes()).await.unwrap();
    let raw = read_until(&mut client, b"\r\n\r\nok").await;
    let raw = String::from_utf8_lossy(&raw).into_owned();
    assert!(raw.starts_with("HTTP/1.1 103 Early Hints\r\n"), "{}", raw);
    assert!(raw.contains("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn test_protocol_upgrade_is_refused() {
    let (origin, _) = scripted_origin(
        b"\r\n\r\n",
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    )
    .await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!(
        "GET http://origin.test:{}/ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 502);
    assert!(response.body_text().contains("Protocol upgrades are not supported"));
}

#[tokio::test]
async fn test_chunked_request_body_is_forwarded() {
    let (origin, seen) = scripted_origin(
        b"0\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let proxy = TestProxy::start(test_config()).await;
    let mut client = proxy.client().await;

    let request = format!(
        "POST http://origin.test:{}/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\ndata\r\n0\r\n\r\n",
        origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(read_response(&mut client).await.status, 200);

    let seen = seen.await.unwrap();
    assert!(seen.contains("Transfer-Encoding: chunked"));
    assert!(seen.contains("data"));
}
