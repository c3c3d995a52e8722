use bytes::{BufMut, Bytes, BytesMut};
use http::{StatusCode, Version};

use super::body::Framing;
use super::headers::HttpHeaders;
use super::html;
use super::{parse_version_keep_alive, version_str, MAX_HEADERS};
use crate::error::{ProxyError, ProxyResult};

/// A response, either parsed from a remote or generated by the proxy.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HttpHeaders,
    pub keep_alive: bool,
    pub framing: Framing,
    /// False for 1xx, 204, 304 and responses to HEAD
    pub has_body: bool,
    /// Body of a generated response
    body: Option<Bytes>,
    headers_sent: bool,
}

impl Response {
    /// Parse a status line and headers read from a remote.
    ///
    /// `request_method` decides whether a body follows at all.
    pub fn parse(block: &[u8], request_method: &str) -> ProxyResult<Response> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut raw_headers);
        match parsed.parse(block) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::header(
                    StatusCode::BAD_GATEWAY,
                    "Incomplete response header",
                ))
            }
            Err(httparse::Error::Status) => {
                return Err(ProxyError::bad_request(format!(
                    "Invalid status code in: {}",
                    first_line(block)
                )))
            }
            Err(e) => {
                return Err(ProxyError::header(
                    StatusCode::BAD_GATEWAY,
                    format!("Invalid header ({}): {}", e, first_line(block)),
                ))
            }
        }

        let code = parsed.code.unwrap_or_default();
        let status = StatusCode::from_u16(code).map_err(|_| {
            ProxyError::bad_request(format!("Invalid status code in: {}", first_line(block)))
        })?;
        let reason = parsed.reason.unwrap_or_default().to_string();
        let mut headers = HttpHeaders::from_parsed(parsed.headers);
        let (version, mut keep_alive) = parse_version_keep_alive(parsed.version, &headers);

        let has_body = !(status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || request_method.eq_ignore_ascii_case("HEAD"));

        let framing = if has_body {
            Framing::from_headers(&mut headers)
                .map_err(|e| ProxyError::header(StatusCode::BAD_GATEWAY, e))?
                .unwrap_or(Framing::UntilClose)
        } else {
            Framing::None
        };
        if !framing.is_delimited() {
            keep_alive = false;
        }

        Ok(Response {
            version,
            status,
            reason,
            headers,
            keep_alive,
            framing,
            has_body,
            body: None,
            headers_sent: false,
        })
    }

    /// HTML page generated by the proxy
    pub fn generated(status: StatusCode, html: String) -> Response {
        let body = Bytes::from(html);
        let mut headers = HttpHeaders::new();
        headers.add("Content-Type", "text/html; charset=UTF-8");
        headers.add("Content-Length", body.len().to_string());

        Response {
            version: Version::HTTP_11,
            status,
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            keep_alive: true,
            framing: Framing::Length(body.len() as u64),
            has_body: true,
            body: Some(body),
            headers_sent: false,
        }
    }

    pub fn message(status: StatusCode, title: &str, message: &str) -> Response {
        Self::generated(status, html::message_page(status, title, message))
    }

    /// Error page for a failed exchange
    pub fn from_error(err: &ProxyError) -> Response {
        let status = err.status_code();
        Self::message(status, &err.to_response_message(), &err.to_string())
    }

    /// Standard page for a request a filter decided to block.
    /// `advisories` are HTML fragments contributed by triggers.
    pub fn blocked(title: &str, message_html: &str, advisories: &[String]) -> Response {
        let status = StatusCode::SERVICE_UNAVAILABLE;
        let mut body = String::from(message_html);
        for advisory in advisories {
            body.push('\n');
            body.push_str(advisory);
        }

        let mut response = Self::generated(status, html::page(status, title, &body));
        response
            .headers
            .replace("Cache-Control", "no-cache, must-revalidate");
        response.headers.replace("Pragma", "no-cache");
        response.headers.add("X-Referer-Filter", "BLOCKED: Unmatched");
        response
    }

    /// The reply that opens a CONNECT tunnel
    pub fn connect_established(proxy_agent: &str) -> Response {
        let mut headers = HttpHeaders::new();
        headers.add("Proxy-Agent", proxy_agent);
        Response {
            version: Version::HTTP_11,
            status: StatusCode::OK,
            reason: "Connection Established".to_string(),
            headers,
            keep_alive: false,
            framing: Framing::None,
            has_body: false,
            body: None,
            headers_sent: false,
        }
    }

    pub fn is_informational(&self) -> bool {
        self.status.is_informational()
    }

    /// Body of a generated response
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn is_generated(&self) -> bool {
        self.body.is_some()
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    /// Make the outgoing `Connection` header match the keep-alive decision.
    /// An HTTP/1.0 peer on either side only keeps the connection open when
    /// told so explicitly.
    pub fn set_connection(&mut self, keep_alive: bool, client: Version) {
        self.keep_alive = keep_alive;
        if keep_alive {
            if self.version == Version::HTTP_10 || client == Version::HTTP_10 {
                self.headers.replace("Connection", "keep-alive");
            } else {
                self.headers.remove("Connection");
            }
        } else {
            self.headers.replace("Connection", "close");
        }
    }

    /// Status line and headers
    pub fn write_head(&self, buf: &mut BytesMut) {
        let reason = if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("")
        } else {
            self.reason.as_str()
        };
        let line = format!(
            "{} {} {}\r\n",
            version_str(self.version),
            self.status.as_u16(),
            reason
        );
        buf.put_slice(line.as_bytes());
        self.headers.write_to(buf);
    }
}

fn first_line(block: &[u8]) -> String {
    let end = block
        .iter()
        .position(|b| *b == b'\r' || *b == b'\n')
        .unwrap_or(block.len());
    String::from_utf8_lossy(&block[..end]).into_owned()
}
