//! Client sessions.
//!
//! A [`ProxySession`] owns one client connection and runs its requests
//! one after another:
//!
//! ```text
//! WaitingForRequest -> ReadingRequest -> Filtering -> Connecting
//!     -> Forwarding -> RespondingOrTunneling -> WaitingForRequest | Closed
//! ```
//!
//! Plain requests are forwarded by [`exchange`], CONNECT requests hand the
//! client socket over to [`tunnel`] and end the session. Errors become a
//! generated page as long as no response header has reached the client;
//! after that the connection is simply closed.

pub mod exchange;
pub mod tunnel;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use http::{StatusCode, Version};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection_pool::{AcquireMode, ConnectionManager, PooledConnection};
use crate::dns::{DnsCache, DnsEntry};
use crate::error::{ProxyError, ProxyResult};
use crate::filter::FilterChain;
use crate::http::{BufferedStream, HostKind, Request, Response, UpstreamKind};
use crate::http_metrics::HttpMetrics;
use crate::logger::{AccessLogEntry, SharedAccessLog};
use crate::socks::socks5_connect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    WaitingForRequest,
    ReadingRequest,
    Filtering,
    Connecting,
    Forwarding,
    RespondingOrTunneling,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::WaitingForRequest => "waiting for request",
            SessionState::ReadingRequest => "reading request",
            SessionState::Filtering => "filtering",
            SessionState::Connecting => "connecting",
            SessionState::Forwarding => "forwarding",
            SessionState::RespondingOrTunneling => "responding",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything sessions of one listener share
pub struct SessionContext {
    pub config: Arc<Config>,
    pub dns: Arc<DnsCache>,
    pub pool: ConnectionManager,
    pub filters: Arc<FilterChain>,
    pub access_log: SharedAccessLog,
    /// Address the listener accepted on, for loopback protection
    pub listen_addr: SocketAddr,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: u64,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub served: u64,
    /// Request being handled, if any
    pub current: Option<String>,
    pub age_ms: u64,
}

struct Progress {
    state: SessionState,
    current: Option<String>,
    closing_since: Option<Instant>,
}

/// Shared between a running session and the listener that tracks it
pub struct SessionHandle {
    id: u64,
    peer: SocketAddr,
    started: Instant,
    progress: Mutex<Progress>,
    served: AtomicU64,
    stop_requested: AtomicBool,
    stop: Notify,
}

impl SessionHandle {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            started: Instant::now(),
            progress: Mutex::new(Progress {
                state: SessionState::WaitingForRequest,
                current: None,
                closing_since: None,
            }),
            served: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Requests started on this connection
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        self.progress().state
    }

    pub fn set_state(&self, state: SessionState) {
        let mut progress = self.progress();
        progress.state = state;
        if state == SessionState::Closed && progress.closing_since.is_none() {
            progress.closing_since = Some(Instant::now());
        }
    }

    fn begin_request(&self, description: String) {
        self.served.fetch_add(1, Ordering::Relaxed);
        self.progress().current = Some(description);
    }

    fn end_request(&self) {
        self.progress().current = None;
    }

    pub fn status(&self) -> SessionStatus {
        let progress = self.progress();
        SessionStatus {
            id: self.id,
            peer: self.peer,
            state: progress.state,
            served: self.served(),
            current: progress.current.clone(),
            age_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Ask the session to stop. Its sockets are closed as soon as its task
    /// next runs.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut progress = self.progress();
            if progress.closing_since.is_none() {
                progress.closing_since = Some(Instant::now());
            }
        }
        self.stop.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](Self::stop) was called
    pub async fn stopped(&self) {
        loop {
            let notified = self.stop.notified();
            if self.is_stopping() {
                return;
            }
            notified.await;
        }
    }

    /// Time since the session closed or was told to stop
    pub fn closing_for(&self) -> Option<Duration> {
        self.progress().closing_since.map(|since| since.elapsed())
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What the session does after an exchange
pub(crate) enum Next {
    KeepAlive,
    Close,
    Tunnel(Request, PooledConnection),
}

impl Next {
    fn from_keep_alive(keep_alive: bool) -> Self {
        if keep_alive {
            Next::KeepAlive
        } else {
            Next::Close
        }
    }
}

pub struct ProxySession {
    ctx: Arc<SessionContext>,
    handle: Arc<SessionHandle>,
    client: BufferedStream<TcpStream>,
}

impl ProxySession {
    pub fn new(ctx: Arc<SessionContext>, handle: Arc<SessionHandle>, client: TcpStream) -> Self {
        let _ = client.set_nodelay(true);
        Self {
            ctx,
            handle,
            client: BufferedStream::new(client),
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Serve the client until it goes away, an exchange ends the
    /// connection or the session is stopped
    pub async fn run(self) {
        let handle = self.handle.clone();
        debug!(session = handle.id(), peer = %handle.peer(), "[SESSION] Started");
        tokio::select! {
            _ = handle.stopped() => {
                debug!(session = handle.id(), "[SESSION] Stopped");
            }
            _ = self.serve() => {}
        }
        handle.set_state(SessionState::Closed);
        debug!(
            session = handle.id(),
            served = handle.served(),
            "[SESSION] Closed"
        );
    }

    async fn serve(mut self) {
        while let Some(request) = self.next_request().await {
            self.handle.begin_request(request.to_string());
            let next = self.handle_request(request).await;
            self.handle.end_request();
            match next {
                Next::KeepAlive => continue,
                Next::Close => break,
                Next::Tunnel(request, conn) => {
                    tunnel::run(self, request, conn).await;
                    return;
                }
            }
        }
        let _ = self.client.shutdown().await;
    }

    /// Wait for and parse the next request. Unreadable requests are
    /// answered here and end the session.
    async fn next_request(&mut self) -> Option<Request> {
        self.handle.set_state(SessionState::WaitingForRequest);
        if !self.client.has_buffered() {
            match timeout(self.ctx.config.client_idle_timeout(), self.client.fill()).await {
                Err(_) => {
                    debug!(session = self.handle.id(), "[SESSION] Client idle, closing");
                    return None;
                }
                Ok(Ok(0)) | Ok(Err(_)) => return None,
                Ok(Ok(_)) => {}
            }
        }

        self.handle.set_state(SessionState::ReadingRequest);
        let max = self.ctx.config.max_header_size;
        let block = match timeout(
            self.ctx.config.read_timeout(),
            self.client.read_header_block(max),
        )
        .await
        {
            Err(_) => {
                self.reject(ProxyError::header(
                    StatusCode::REQUEST_TIMEOUT,
                    "Timed out reading the request header",
                ))
                .await;
                return None;
            }
            Ok(Ok(Some(block))) => block,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) if e.is_disconnect() => return None,
            Ok(Err(e)) => {
                self.reject(e).await;
                return None;
            }
        };

        match Request::parse(&block) {
            Ok(request) => Some(request),
            Err(e) => {
                self.reject(e).await;
                None
            }
        }
    }

    /// Answer a request that could not be read; the session closes after
    async fn reject(&mut self, err: ProxyError) {
        warn!(
            session = self.handle.id(),
            peer = %self.handle.peer(),
            error = %err,
            "[SESSION] Invalid request"
        );
        HttpMetrics::record_error(err.kind());

        let mut response = Response::from_error(&err);
        response.set_connection(false, Version::HTTP_11);
        let mut entry = AccessLogEntry::new(self.handle.peer(), "-", "-");
        entry.status = Some(response.status.as_u16());
        entry.error = Some(err.to_string());
        if let Ok(bytes) = self.write_response(&mut response).await {
            entry.response_bytes = bytes;
        }
        self.ctx.access_log.record(entry);
    }

    async fn handle_request(&mut self, mut request: Request) -> Next {
        let mut entry = AccessLogEntry::new(self.handle.peer(), &request.method, &request.target);
        debug!(session = self.handle.id(), request = %request, "[SESSION] Request");

        self.handle.set_state(SessionState::Filtering);
        self.ctx.filters.filter_request(&mut request);

        let next = if request.has_response() {
            self.respond_locally(&mut request, &mut entry).await
        } else {
            match self.connect(&mut request).await {
                Ok(Some(conn)) if request.is_connect() => return Next::Tunnel(request, conn),
                Ok(Some(conn)) => {
                    self.handle.set_state(SessionState::Forwarding);
                    exchange::forward(self, &mut request, conn, &mut entry).await
                }
                Ok(None) => self.respond_locally(&mut request, &mut entry).await,
                Err(e) => self.fail(&mut request, e, &mut entry).await,
            }
        };

        let elapsed = request.elapsed();
        entry.duration_ms = elapsed.as_millis() as u64;
        entry.keep_alive = matches!(next, Next::KeepAlive);
        if let Some(status) = entry.status {
            HttpMetrics::record_request(&request.method, status, elapsed.as_secs_f64());
        }
        self.ctx.access_log.record(entry);
        next
    }

    /// Check the target and get a connection for it. Returns `None` when a
    /// response was attached instead.
    async fn connect(&mut self, request: &mut Request) -> ProxyResult<Option<PooledConnection>> {
        self.handle.set_state(SessionState::Connecting);

        if !request.scheme_supported() {
            return Err(request.unsupported_scheme());
        }
        if request.target.host_kind() == HostKind::Unknown {
            return Err(ProxyError::bad_request(format!(
                "Invalid URL: bad host name '{}'",
                request.target.host
            )));
        }

        // A chained request may name a host only the upstream can resolve
        if request.upstream_proxy.is_none() {
            let entry = self.ctx.dns.resolve(&request.target.host).await?;
            if self.is_self(&entry, request.target.port) {
                warn!(
                    session = self.handle.id(),
                    target = %request.target,
                    "[SESSION] Refusing request addressed to the proxy itself"
                );
                request.block(
                    "Loopback protection",
                    "<p>The proxy will not forward a request to itself.</p>",
                )?;
                return Ok(None);
            }
        }

        self.acquire(request, false).await.map(Some)
    }

    /// True if `entry:port` is the listener itself
    fn is_self(&self, entry: &DnsEntry, port: u16) -> bool {
        let listen = self.ctx.listen_addr;
        port == listen.port()
            && entry
                .addresses
                .iter()
                .any(|ip| ip.is_loopback() || ip.is_unspecified() || *ip == listen.ip())
    }

    /// Connection to the target or to the upstream proxy it is routed
    /// through. CONNECT and SOCKS chaining never share pooled connections.
    pub(crate) async fn acquire(&self, request: &Request, fresh: bool) -> ProxyResult<PooledConnection> {
        let socks = request
            .upstream_proxy
            .as_ref()
            .filter(|upstream| upstream.kind == UpstreamKind::Socks);
        let (host, port) = match &request.upstream_proxy {
            Some(upstream) => (upstream.host.as_str(), upstream.port),
            None => (request.target.host.as_str(), request.target.port),
        };
        let entry = self.ctx.dns.resolve(host).await?;

        let (mode, block) = if request.is_connect() || socks.is_some() {
            (AcquireMode::Unlimited, false)
        } else if fresh {
            (AcquireMode::Fresh, true)
        } else {
            (AcquireMode::Reuse, true)
        };
        let mut conn = self.ctx.pool.acquire(&entry, port, mode, block).await?;

        if let Some(upstream) = socks {
            debug!(
                upstream = %upstream,
                target = %request.target.authority(),
                "[SOCKS] Negotiating"
            );
            timeout(
                self.ctx.config.read_timeout(),
                socks5_connect(conn.stream(), &request.target.host, request.target.port),
            )
            .await
            .map_err(|_| ProxyError::Timeout("negotiating with the SOCKS upstream"))??;
        }
        Ok(conn)
    }

    /// Send the response attached to `request` (generated by a filter or
    /// the proxy)
    async fn respond_locally(&mut self, request: &mut Request, entry: &mut AccessLogEntry) -> Next {
        self.handle.set_state(SessionState::RespondingOrTunneling);
        let Some(mut response) = request.take_response() else {
            return Next::Close;
        };

        // An unread request body would be parsed as the next request
        let keep_alive = request.keep_alive && response.keep_alive && !request.framing.has_body();
        response.set_connection(keep_alive, request.version);
        entry.status = Some(response.status.as_u16());

        let next = match self.write_response(&mut response).await {
            Ok(bytes) => {
                entry.response_bytes = bytes;
                Next::from_keep_alive(keep_alive)
            }
            Err(e) => {
                debug!(session = self.handle.id(), error = %e, "[SESSION] Client went away");
                entry.error.get_or_insert_with(|| e.to_string());
                Next::Close
            }
        };
        let _ = request.set_response(response);
        next
    }

    /// Report a failed exchange. A page is only sent while no response
    /// header has reached the client; the connection closes either way.
    pub(crate) async fn fail(
        &mut self,
        request: &mut Request,
        err: ProxyError,
        entry: &mut AccessLogEntry,
    ) -> Next {
        HttpMetrics::record_error(err.kind());
        entry.error = Some(err.to_string());
        if err.is_disconnect() {
            debug!(session = self.handle.id(), request = %request, error = %err, "[SESSION] Peer disconnected");
        } else {
            warn!(session = self.handle.id(), request = %request, error = %err, "[SESSION] Exchange failed");
        }

        let mut response = Response::from_error(&err);
        response.set_connection(false, request.version);
        if request.set_response(response).is_err() {
            debug!(session = self.handle.id(), "[SESSION] Response already started, closing");
            return Next::Close;
        }
        self.respond_locally(request, entry).await;
        Next::Close
    }

    /// Write a complete generated response to the client
    async fn write_response(&mut self, response: &mut Response) -> ProxyResult<u64> {
        let mut buf = BytesMut::new();
        response.write_head(&mut buf);
        let body_len = match response.body() {
            Some(body) => {
                buf.extend_from_slice(body);
                body.len() as u64
            }
            None => 0,
        };
        response.mark_headers_sent();
        self.client.write_all(&buf).await?;
        self.client.flush().await?;
        Ok(body_len)
    }
}
