//! HTTP/1.x message framing.
//!
//! - `headers` - ordered header multimap
//! - `flags` - trigger tags carried by a request
//! - `request` / `response` - start lines, parsed transfer metadata
//! - `stream` - buffered socket wrapper with byte counters
//! - `body` - framing selection and body relaying
//! - `chunked` - chunked transfer-coding
//! - `html` - generated pages

pub mod body;
pub mod chunked;
pub mod flags;
pub mod headers;
pub mod html;
pub mod request;
pub mod response;
pub mod stream;

pub use body::{relay_body, Framing};
pub use chunked::{ChunkEvent, ChunkedDecoder, ChunkedWriter};
pub use flags::Flags;
pub use headers::HttpHeaders;
pub use request::{host_kind, HostKind, Request, Target, UpstreamKind, UpstreamProxy};
pub use response::Response;
pub use stream::{BufferedStream, SocketState};

use http::Version;

/// Maximum number of header lines in one message
pub(crate) const MAX_HEADERS: usize = 100;

pub(crate) fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// HTTP version and keep-alive default, overridden by an explicit
/// `Connection` header
pub(crate) fn parse_version_keep_alive(minor: Option<u8>, headers: &HttpHeaders) -> (Version, bool) {
    let (version, default) = match minor {
        Some(0) => (Version::HTTP_10, false),
        _ => (Version::HTTP_11, true),
    };
    let keep_alive = if headers.has_token("Connection", "close") {
        false
    } else if headers.has_token("Connection", "keep-alive") {
        true
    } else {
        default
    };
    (version, keep_alive)
}
