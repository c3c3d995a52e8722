//! Shared fixtures: a proxy on an ephemeral port, scripted origins and a
//! minimal response reader.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use sidegate::dns::Resolved;
use sidegate::{Config, DnsCache, DnsError, FilterChain, HostResolver, ProxyListener};

/// Resolves a fixed set of names, everything else fails
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn localhost(names: &[&str]) -> Self {
        Self {
            hosts: names
                .iter()
                .map(|name| (name.to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST)))
                .collect(),
        }
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Resolved, DnsError> {
        match self.hosts.get(host) {
            Some(ip) => Ok(Resolved {
                addresses: vec![*ip],
                names: vec![host.to_string()],
            }),
            None => Err(DnsError::NotFound(host.to_string())),
        }
    }
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        read_timeout_seconds: 5,
        client_idle_timeout_seconds: 5,
        connect_timeout_seconds: 2,
        pool_wait_seconds: 1,
        watchdog_grace_seconds: 1,
        ..Config::default()
    }
}

pub struct TestProxy {
    pub listener: Arc<ProxyListener>,
    pub addr: SocketAddr,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestProxy {
    pub async fn start(config: Config) -> Self {
        let filters = FilterChain::from_config(&config).unwrap();
        Self::start_with(config, filters).await
    }

    pub async fn start_with(config: Config, filters: FilterChain) -> Self {
        let dns = DnsCache::new(
            Arc::new(StaticResolver::localhost(&["origin.test", "other.test"])),
            64,
            Duration::from_secs(60),
            false,
        );
        let listener = Arc::new(
            ProxyListener::bind_with(config, Arc::new(dns), Arc::new(filters))
                .await
                .unwrap(),
        );
        let addr = listener.local_addr();
        let task = listener.spawn();
        Self { listener, addr, task }
    }

    pub async fn client(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.listener.stop();
        self.task.abort();
    }
}

/// Origin that answers every request on every connection with `response`.
/// Returns its port and a counter of accepted connections.
pub async fn spawn_origin(response: &'static str) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    while let Some(end) = find(&buf, b"\r\n\r\n") {
                        buf.drain(..end + 4);
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
            });
        }
    });
    (port, accepted)
}

/// Origin that echoes bytes back until the peer half-closes
pub async fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    port
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub struct TestResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read one response, framed by Content-Length, chunked encoding or close
pub async fn read_response(stream: &mut TcpStream) -> TestResponse {
    tokio::time::timeout(Duration::from_secs(5), read_response_inner(stream))
        .await
        .expect("timed out reading response")
}

async fn read_response_inner(stream: &mut TcpStream) -> TestResponse {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            break end + 4;
        }
        fill(stream, &mut buf).await;
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut rest = buf.split_off(head_end);
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");

    let response = TestResponse {
        status,
        head,
        body: Vec::new(),
    };
    let body = if let Some(length) = response.header("Content-Length") {
        let length: usize = length.parse().unwrap();
        while rest.len() < length {
            fill(stream, &mut rest).await;
        }
        rest.truncate(length);
        rest
    } else if response
        .header("Transfer-Encoding")
        .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
    {
        read_chunked(stream, rest).await
    } else {
        let _ = stream.read_to_end(&mut rest).await;
        rest
    };
    TestResponse { body, ..response }
}

async fn read_chunked(stream: &mut TcpStream, mut buf: Vec<u8>) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(end) = find(&buf, b"\r\n") {
                break end;
            }
            fill(stream, &mut buf).await;
        };
        let size_line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16).unwrap();
        buf.drain(..line_end + 2);
        if size == 0 {
            while find(&buf, b"\r\n").is_none() {
                fill(stream, &mut buf).await;
            }
            return body;
        }
        while buf.len() < size + 2 {
            fill(stream, &mut buf).await;
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
}

async fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await.unwrap();
    assert!(n > 0, "connection closed early: {:?}", String::from_utf8_lossy(buf));
    buf.extend_from_slice(&chunk[..n]);
}

/// True once the peer has closed the connection
pub async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut byte = [0u8; 1];
    matches!(
        tokio::time::timeout(Duration::from_secs(2), stream.read(&mut byte)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}
