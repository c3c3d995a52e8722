//! One plain HTTP exchange over a pooled connection.

use bytes::{Bytes, BytesMut};
use http::{StatusCode, Version};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Next, ProxySession, SessionState};
use crate::connection_pool::{PooledConnection, ReleaseOutcome};
use crate::error::{ProxyError, ProxyResult};
use crate::http::{relay_body, Request, Response};
use crate::http_metrics::HttpMetrics;
use crate::logger::AccessLogEntry;

/// Forward `request` over `conn` and stream the response back
pub(crate) async fn forward(
    session: &mut ProxySession,
    request: &mut Request,
    conn: PooledConnection,
    entry: &mut AccessLogEntry,
) -> Next {
    match exchange(session, request, conn, entry).await {
        Ok(next) => next,
        Err(e) => session.fail(request, e, entry).await,
    }
}

fn no_response() -> ProxyError {
    ProxyError::header(
        StatusCode::BAD_GATEWAY,
        "The server closed the connection without sending a response",
    )
}

async fn exchange(
    session: &mut ProxySession,
    request: &mut Request,
    mut conn: PooledConnection,
    entry: &mut AccessLogEntry,
) -> ProxyResult<Next> {
    let ctx = session.ctx.clone();

    if request.headers.has_token("Expect", "100-continue") {
        request.headers.remove("Expect");
        // HTTP/1.0 clients never wait for an interim response
        if request.framing.has_body() && request.version == Version::HTTP_11 {
            session.client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            session.client.flush().await?;
        }
    }

    let mut head = BytesMut::new();
    request.write_head(&mut head);
    let head = head.freeze();

    let retryable = conn.is_reused() && !request.framing.has_body();
    let first = match send_request(session, request, &mut conn, &head).await {
        Ok(response) => response,
        Err(e) if retryable && e.is_disconnect() => None,
        Err(e) => return Err(e),
    };
    let response = match first {
        Some(response) => response,
        // The origin dropped an idle connection just as it was reused
        None if retryable => {
            debug!(
                destination = %conn.destination(),
                id = conn.id(),
                "[SESSION] Reused connection was closed by the server, retrying"
            );
            ctx.pool.dispose(conn);
            conn = session.acquire(request, true).await?;
            send_request(session, request, &mut conn, &head)
                .await?
                .ok_or_else(no_response)?
        }
        None => return Err(no_response()),
    };

    let remote_keep_alive = response.keep_alive;
    entry.status = Some(response.status.as_u16());
    request.set_response(response)?;

    session.handle.set_state(SessionState::RespondingOrTunneling);
    ctx.filters.filter_response(request);

    let client_keep_alive = request.keep_alive;
    let client_version = request.version;
    let Some(response) = request.response_mut() else {
        return Err(ProxyError::header(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Response filters removed the response",
        ));
    };
    if response.is_generated() {
        // Replaced by a filter: the remote body was never read
        ctx.pool.dispose(conn);
        return Ok(session.respond_locally(request, entry).await);
    }

    let keep_alive = client_keep_alive && response.keep_alive && response.framing.is_delimited();
    response.set_connection(keep_alive, client_version);
    let framing = response.framing;

    let mut head = BytesMut::new();
    response.write_head(&mut head);
    response.mark_headers_sent();
    session.client.write_all(&head).await?;

    let relayed = relay_body(framing, conn.stream(), &mut session.client).await?;
    HttpMetrics::record_bytes("downstream", relayed);
    entry.response_bytes = relayed;

    if !remote_keep_alive {
        ctx.pool.dispose(conn);
        return Ok(Next::from_keep_alive(keep_alive));
    }
    match ctx.pool.release(conn) {
        ReleaseOutcome::DisposedTrailing(bytes) => {
            warn!(
                session = session.handle.id(),
                request = %request,
                bytes,
                "[SESSION] Server sent data past the end of the response, closing client"
            );
            Ok(Next::Close)
        }
        ReleaseOutcome::Idle | ReleaseOutcome::Disposed => Ok(Next::from_keep_alive(keep_alive)),
    }
}

/// Send the request head and body, then read up to the final response
/// header. Provisional 1xx responses are passed on to the client.
///
/// Returns `None` if the server closed before sending anything.
async fn send_request(
    session: &mut ProxySession,
    request: &Request,
    conn: &mut PooledConnection,
    head: &Bytes,
) -> ProxyResult<Option<Response>> {
    let config = session.ctx.config.clone();
    let remote = conn.stream();

    remote.write_all(head).await?;
    let sent = relay_body(request.framing, &mut session.client, &mut *remote)
        .await
        .map_err(ProxyError::into_client_error)?;
    HttpMetrics::record_bytes("upstream", sent);

    loop {
        let block = timeout(
            config.read_timeout(),
            remote.read_header_block(config.max_header_size),
        )
        .await
        .map_err(|_| ProxyError::Timeout("waiting for the response header"))??;
        let Some(block) = block else {
            return Ok(None);
        };

        let response = Response::parse(&block, &request.method)?;
        if !response.is_informational() {
            return Ok(Some(response));
        }
        if response.status == StatusCode::SWITCHING_PROTOCOLS {
            return Err(ProxyError::header(
                StatusCode::BAD_GATEWAY,
                "Protocol upgrades are not supported",
            ));
        }
        debug!(status = response.status.as_u16(), "[SESSION] Provisional response");
        if request.version == Version::HTTP_11 {
            let mut head = BytesMut::new();
            response.write_head(&mut head);
            session.client.write_all(&head).await?;
            session.client.flush().await?;
        }
    }
}
