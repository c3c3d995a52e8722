//! Error taxonomy for the proxying engine.
//!
//! Every error that can end an exchange carries the HTTP status the client
//! should see, so the session can turn it into a generated page without
//! inspecting the error further.

use http::StatusCode;
use std::io;
use thiserror::Error;

use crate::connection_pool::PoolError;
use crate::dns::DnsError;
use crate::socks::SocksError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Protocol error with the status to report to the client
    #[error("{message}")]
    Header { status: StatusCode, message: String },

    #[error("Header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Peer closed the connection before the header was complete")]
    IncompleteHeader,

    #[error("Chunked body desynchronized: {0}")]
    ChunkDesync(String),

    #[error("Body ended after {received} of {expected} bytes")]
    ShortBody { expected: u64, received: u64 },

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("DNS lookup failed: {0}")]
    Lookup(#[from] DnsError),

    #[error("{0}")]
    Pool(#[from] PoolError),

    #[error("SOCKS upstream refused the request: {0}")]
    Socks(#[from] SocksError),

    #[error("Response headers were already sent to the client")]
    HeadersAlreadySent,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn header(status: StatusCode, message: impl Into<String>) -> Self {
        ProxyError::Header {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::header(StatusCode::BAD_REQUEST, message)
    }

    /// Reclassify a body error raised while reading from the client: a
    /// malformed or truncated request body is the client's fault.
    pub fn into_client_error(self) -> Self {
        match self {
            ProxyError::ShortBody { .. } | ProxyError::ChunkDesync(_) => {
                Self::bad_request(format!("Invalid request body: {}", self))
            }
            other => other,
        }
    }

    /// Status code the client should see for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Header { status, .. } => *status,
            ProxyError::HeaderTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::IncompleteHeader => StatusCode::BAD_REQUEST,
            ProxyError::ChunkDesync(_) | ProxyError::ShortBody { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Lookup(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Pool(err) => err.status_code(),
            ProxyError::Socks(_) => StatusCode::BAD_GATEWAY,
            ProxyError::HeadersAlreadySent => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Io(err) if err.kind() == io::ErrorKind::TimedOut => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::Io(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label used for metrics and the access log
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Header { .. } => "header",
            ProxyError::HeaderTooLarge { .. } => "header_too_large",
            ProxyError::IncompleteHeader => "incomplete_header",
            ProxyError::ChunkDesync(_) => "chunk_desync",
            ProxyError::ShortBody { .. } => "short_body",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Lookup(_) => "dns",
            ProxyError::Pool(_) => "pool",
            ProxyError::Socks(_) => "socks",
            ProxyError::HeadersAlreadySent => "headers_sent",
            ProxyError::Io(_) => "io",
        }
    }

    /// Title for the generated error page
    pub fn to_response_message(&self) -> String {
        match self.status_code() {
            StatusCode::GATEWAY_TIMEOUT => "Gateway Timeout".to_string(),
            StatusCode::BAD_GATEWAY => "Bad Gateway".to_string(),
            status => status
                .canonical_reason()
                .unwrap_or("Proxy Error")
                .to_string(),
        }
    }

    /// True when the peer simply went away; only worth a debug log
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::IncompleteHeader => true,
            ProxyError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_error_carries_status() {
        let err = ProxyError::header(StatusCode::NOT_IMPLEMENTED, "ftp is not supported");
        assert_eq!(err.status_code(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(err.to_string(), "ftp is not supported");
    }

    #[test]
    fn test_client_body_errors_become_400() {
        let short = ProxyError::ShortBody {
            expected: 10,
            received: 4,
        };
        assert_eq!(short.status_code(), StatusCode::BAD_GATEWAY);
        let short = short.into_client_error();
        assert_eq!(short.status_code(), StatusCode::BAD_REQUEST);
        assert!(short.to_string().contains("4 of 10 bytes"));

        let desync = ProxyError::ChunkDesync("bad size line".into()).into_client_error();
        assert_eq!(desync.status_code(), StatusCode::BAD_REQUEST);

        let io = ProxyError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).into_client_error();
        assert!(io.is_disconnect());
    }

    #[test]
    fn test_timeouts_map_to_504() {
        assert_eq!(
            ProxyError::Timeout("connecting").status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        let io_timeout = ProxyError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(io_timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(io_timeout.to_response_message(), "Gateway Timeout");
    }

    #[test]
    fn test_connectivity_errors_map_to_502() {
        let refused = ProxyError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "no"));
        assert_eq!(refused.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(refused.to_response_message(), "Bad Gateway");
    }

    #[test]
    fn test_oversized_header_is_413() {
        let err = ProxyError::HeaderTooLarge { limit: 16384 };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.kind(), "header_too_large");
    }

    #[test]
    fn test_disconnect_detection() {
        let reset = ProxyError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_disconnect());
        assert!(!ProxyError::bad_request("nope").is_disconnect());
    }
}
