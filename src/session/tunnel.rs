//! CONNECT tunnels.
//!
//! After the `200 Connection Established` reply the client and remote
//! sockets are split and copied in both directions, the remote-to-client
//! half on its own task. When one direction finishes the other gets one
//! read timeout to drain before it is cut off. Tunnel connections are
//! never returned to the pool.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{ProxySession, SessionContext, SessionState};
use crate::connection_pool::PooledConnection;
use crate::error::{ProxyError, ProxyResult};
use crate::http::{relay_body, BufferedStream, Framing, Request, Response, UpstreamKind};
use crate::http_metrics::{HttpMetrics, ACTIVE_TUNNELS};
use crate::logger::AccessLogEntry;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Open the tunnel for `request` over `conn` and run it to completion
pub(crate) async fn run(mut session: ProxySession, mut request: Request, mut conn: PooledConnection) {
    let ctx = session.ctx.clone();
    let mut entry = AccessLogEntry::new(session.handle.peer(), &request.method, &request.target);
    session.handle.set_state(SessionState::RespondingOrTunneling);

    let via_http_upstream = request
        .upstream_proxy
        .as_ref()
        .is_some_and(|upstream| upstream.kind == UpstreamKind::Http);
    if via_http_upstream {
        match connect_upstream(&mut session, &request, &mut conn).await {
            Ok(None) => {}
            Ok(Some(refusal)) => {
                entry.status = Some(refusal.status.as_u16());
                relay_refusal(&mut session, &request, refusal, &mut conn, &mut entry).await;
                finish(&ctx, &request, entry);
                return;
            }
            Err(e) => {
                drop(conn);
                session.fail(&mut request, e, &mut entry).await;
                finish(&ctx, &request, entry);
                return;
            }
        }
    }

    let mut established = Response::connect_established(&ctx.config.proxy_agent);
    let mut head = BytesMut::new();
    established.write_head(&mut head);
    established.mark_headers_sent();
    entry.status = Some(established.status.as_u16());
    let _ = request.set_response(established);
    if let Err(e) = session.client.write_all(&head).await {
        entry.error = Some(e.to_string());
        finish(&ctx, &request, entry);
        return;
    }

    info!(
        session = session.handle.id(),
        target = %request.target,
        destination = %conn.destination(),
        "[CONNECT] Tunnel open"
    );

    let ProxySession { handle, client, .. } = session;
    let (upload, download) = pipe(client, conn, ctx.config.read_timeout()).await;
    HttpMetrics::record_bytes("upstream", upload);
    HttpMetrics::record_bytes("downstream", download);
    entry.response_bytes = download;

    info!(
        session = handle.id(),
        target = %request.target,
        upload,
        download,
        duration_ms = request.elapsed().as_millis() as u64,
        "[CONNECT] Tunnel closed"
    );
    finish(&ctx, &request, entry);
}

fn finish(ctx: &SessionContext, request: &Request, mut entry: AccessLogEntry) {
    let elapsed = request.elapsed();
    entry.duration_ms = elapsed.as_millis() as u64;
    if let Some(status) = entry.status {
        HttpMetrics::record_request(&request.method, status, elapsed.as_secs_f64());
    }
    ctx.access_log.record(entry);
}

/// Forward the CONNECT to an HTTP upstream. Returns the upstream's answer
/// when it refused.
async fn connect_upstream(
    session: &mut ProxySession,
    request: &Request,
    conn: &mut PooledConnection,
) -> ProxyResult<Option<Response>> {
    let config = session.ctx.config.clone();
    let mut head = BytesMut::new();
    request.write_head(&mut head);

    let remote = conn.stream();
    remote.write_all(&head).await?;
    remote.flush().await?;

    let block = timeout(
        config.read_timeout(),
        remote.read_header_block(config.max_header_size),
    )
    .await
    .map_err(|_| ProxyError::Timeout("waiting for the upstream proxy"))??
    .ok_or_else(|| {
        ProxyError::header(
            http::StatusCode::BAD_GATEWAY,
            "The upstream proxy closed the connection",
        )
    })?;

    let response = Response::parse(&block, &request.method)?;
    if response.status.is_success() {
        debug!(target = %request.target, "[CONNECT] Upstream proxy accepted");
        Ok(None)
    } else {
        debug!(
            target = %request.target,
            status = response.status.as_u16(),
            "[CONNECT] Upstream proxy refused"
        );
        Ok(Some(response))
    }
}

/// Pass an upstream proxy's refusal on to the client as it came
async fn relay_refusal(
    session: &mut ProxySession,
    request: &Request,
    mut refusal: Response,
    conn: &mut PooledConnection,
    entry: &mut AccessLogEntry,
) {
    refusal.set_connection(false, request.version);
    let mut head = BytesMut::new();
    refusal.write_head(&mut head);
    if session.client.write_all(&head).await.is_err() {
        return;
    }

    // A refusal without framing would hold the tunnel slot until the
    // upstream closes
    let framing = match refusal.framing {
        Framing::UntilClose => Framing::None,
        framing => framing,
    };
    let read_timeout = session.ctx.config.read_timeout();
    match timeout(read_timeout, relay_body(framing, conn.stream(), &mut session.client)).await {
        Ok(Ok(bytes)) => entry.response_bytes = bytes,
        Ok(Err(e)) => entry.error = Some(e.to_string()),
        Err(_) => entry.error = Some(format!("relaying the refusal for {} timed out", request.target)),
    }
    let _ = session.client.shutdown().await;
}

/// Counts an open tunnel for as long as it lives
struct TunnelGauge;

impl TunnelGauge {
    fn open() -> Self {
        ACTIVE_TUNNELS.inc();
        TunnelGauge
    }
}

impl Drop for TunnelGauge {
    fn drop(&mut self) {
        ACTIVE_TUNNELS.dec();
    }
}

/// Aborts the reverse copy if the tunnel is torn down first
struct AbortOnDrop(JoinHandle<u64>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Copy bytes both ways until both directions finish or the slower one
/// runs out of its drain time. Returns (client to remote, remote to client)
/// byte counts.
pub(crate) async fn pipe(
    client: BufferedStream<TcpStream>,
    conn: PooledConnection,
    drain: Duration,
) -> (u64, u64) {
    let _gauge = TunnelGauge::open();
    let (remote, lease) = conn.into_parts();
    let (client_pending, client) = client.into_parts();
    let (remote_pending, remote) = remote.into_parts();
    let (mut client_read, mut client_write) = client.into_split();
    let (mut remote_read, mut remote_write) = remote.into_split();

    let mut reverse = AbortOnDrop(tokio::spawn(async move {
        let mut total = 0;
        if !remote_pending.is_empty() {
            if client_write.write_all(&remote_pending).await.is_err() {
                return total;
            }
            total += remote_pending.len() as u64;
        }
        total += copy_counted(&mut remote_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        total
    }));

    let forward = async move {
        let mut total = 0;
        if !client_pending.is_empty() {
            if remote_write.write_all(&client_pending).await.is_err() {
                return total;
            }
            total += client_pending.len() as u64;
        }
        total += copy_counted(&mut client_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
        total
    };
    tokio::pin!(forward);

    let (upload, download) = tokio::select! {
        upload = &mut forward => {
            debug!("[CONNECT] Client side finished, draining remote");
            let download = match timeout(drain, &mut reverse.0).await {
                Ok(Ok(download)) => download,
                _ => 0,
            };
            (upload, download)
        }
        download = &mut reverse.0 => {
            debug!("[CONNECT] Remote side finished, draining client");
            let upload = timeout(drain, &mut forward).await.unwrap_or(0);
            (upload, download.unwrap_or(0))
        }
    };

    drop(reverse);
    drop(lease);
    (upload, download)
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_counted_until_eof() {
        let (mut near, far) = tokio::io::duplex(64);
        let (mut far_read, _far_write) = tokio::io::split(far);
        let writer = tokio::spawn(async move {
            near.write_all(&[7u8; 40_000]).await.unwrap();
            near.shutdown().await.unwrap();
        });

        let mut sink = Vec::new();
        let copied = copy_counted(&mut far_read, &mut sink).await;
        writer.await.unwrap();
        assert_eq!(copied, 40_000);
        assert_eq!(sink.len(), 40_000);
    }

    #[test]
    fn test_tunnel_gauge_tracks_open_tunnels() {
        let before = ACTIVE_TUNNELS.get();
        let gauge = TunnelGauge::open();
        assert!(ACTIVE_TUNNELS.get() >= before + 1);
        drop(gauge);
    }
}
