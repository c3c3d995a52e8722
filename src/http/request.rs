use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use http::{StatusCode, Version};
use thiserror::Error;

use super::body::Framing;
use super::flags::Flags;
use super::headers::HttpHeaders;
use super::response::Response;
use super::{parse_version_keep_alive, version_str, MAX_HEADERS};
use crate::error::{ProxyError, ProxyResult};

/// Kind of host name in a request target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Dns,
    Ipv4,
    Ipv6,
    Unknown,
}

pub fn host_kind(host: &str) -> HostKind {
    if host.parse::<Ipv4Addr>().is_ok() {
        return HostKind::Ipv4;
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        return HostKind::Ipv6;
    }
    let valid_dns = !host.is_empty()
        && host.len() <= 253
        && host.trim_end_matches('.').split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        });
    if valid_dns {
        HostKind::Dns
    } else {
        HostKind::Unknown
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "connect" => 443,
        "ftp" => 21,
        _ => 80,
    }
}

/// Split `host[:port]` (with optional userinfo and IPv6 brackets)
fn parse_authority(authority: &str, default: u16) -> Result<(String, u16), String> {
    let authority = match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    };

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| format!("Unterminated IPv6 literal in '{}'", authority))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (authority, None),
        }
    };

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }
    let port = match port {
        Some(p) => match p.parse::<u16>() {
            Ok(0) | Err(_) => return Err(format!("Invalid port '{}'", p)),
            Ok(port) => port,
        },
        None => default,
    };
    Ok((host.to_ascii_lowercase(), port))
}

/// Where a request is going
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Lowercase scheme; `connect` for CONNECT requests
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path and query; empty for CONNECT
    pub path: String,
}

impl Target {
    /// Parse a request-target. Origin-form targets are resolved against
    /// the `Host` header.
    pub fn parse(raw: &str, is_connect: bool, host_header: Option<&str>) -> ProxyResult<Target> {
        let invalid = |detail: String| ProxyError::bad_request(format!("Invalid URL: {}", detail));

        if is_connect {
            let (host, port) = parse_authority(raw, default_port("connect")).map_err(invalid)?;
            return Ok(Target {
                scheme: "connect".to_string(),
                host,
                port,
                path: String::new(),
            });
        }

        let (scheme, rest) = if raw.starts_with('/') {
            let host = host_header
                .filter(|h| !h.trim().is_empty())
                .ok_or_else(|| ProxyError::bad_request("Invalid URL: missing Host header"))?;
            let (host, port) = parse_authority(host.trim(), 80).map_err(invalid)?;
            let path = raw.split('#').next().unwrap_or(raw).to_string();
            return Ok(Target {
                scheme: "http".to_string(),
                host,
                port,
                path,
            });
        } else if let Some((scheme, rest)) = raw.split_once("://") {
            (scheme.to_ascii_lowercase(), rest)
        } else {
            ("http".to_string(), raw)
        };

        let rest = rest.split('#').next().unwrap_or(rest);
        let split = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split);
        let path = match path.chars().next() {
            None => "/".to_string(),
            Some('?') => format!("/{}", path),
            Some(_) => path.to_string(),
        };
        let (host, port) = parse_authority(authority, default_port(&scheme)).map_err(invalid)?;

        Ok(Target {
            scheme,
            host,
            port,
            path,
        })
    }

    pub fn host_kind(&self) -> HostKind {
        host_kind(&self.host)
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for a `Host` header; the port is omitted when it is the default
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port(&self.scheme) {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == "connect" {
            write!(f, "{}", self.authority())
        } else {
            write!(f, "{}://{}{}", self.scheme, self.host_header(), self.path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Http,
    Socks,
}

/// Another proxy requests are chained through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub kind: UpstreamKind,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
#[error("Invalid upstream proxy '{0}': expected http://host:port or socks://host:port")]
pub struct InvalidUpstream(String);

impl FromStr for UpstreamProxy {
    type Err = InvalidUpstream;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidUpstream(s.to_string());
        let (scheme, rest) = s.trim().split_once("://").ok_or_else(invalid)?;
        let (kind, default) = match scheme.to_ascii_lowercase().as_str() {
            "http" => (UpstreamKind::Http, 8080),
            "socks" | "socks5" => (UpstreamKind::Socks, 1080),
            _ => return Err(invalid()),
        };
        let (host, port) = parse_authority(rest.trim_end_matches('/'), default).map_err(|_| invalid())?;
        Ok(UpstreamProxy { kind, host, port })
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            UpstreamKind::Http => "http",
            UpstreamKind::Socks => "socks",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A client request together with the routing decisions and response
/// the session attaches to it.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: Target,
    pub version: Version,
    pub headers: HttpHeaders,
    /// Tags set by triggers, read by filters
    pub flags: Flags,
    pub keep_alive: bool,
    pub framing: Framing,
    /// Chain through this proxy instead of connecting directly
    pub upstream_proxy: Option<UpstreamProxy>,
    trigger_html: Vec<String>,
    response: Option<Response>,
    started: Instant,
}

impl Request {
    /// Parse a request line and headers
    pub fn parse(block: &[u8]) -> ProxyResult<Request> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut raw_headers);
        match parsed.parse(block) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::bad_request("Incomplete request header"))
            }
            Err(e) => {
                let line = block.split(|b| *b == b'\n').next().unwrap_or_default();
                return Err(ProxyError::bad_request(format!(
                    "Invalid header ({}): {}",
                    e,
                    String::from_utf8_lossy(line).trim_end()
                )));
            }
        }

        let method = parsed.method.unwrap_or_default().to_ascii_uppercase();
        let raw_target = parsed.path.unwrap_or_default().to_string();
        let mut headers = HttpHeaders::from_parsed(parsed.headers);
        let minor = parsed.version;
        let is_connect = method == "CONNECT";

        let target = Target::parse(&raw_target, is_connect, headers.get("Host"))?;

        let mut request = Request {
            method,
            target,
            version: Version::HTTP_11,
            headers: HttpHeaders::new(),
            flags: Flags::new(),
            keep_alive: false,
            framing: Framing::None,
            upstream_proxy: None,
            trigger_html: Vec::new(),
            response: None,
            started: Instant::now(),
        };

        if is_connect {
            request.version = if minor == Some(0) {
                Version::HTTP_10
            } else {
                Version::HTTP_11
            };
            request.headers = headers;
            return Ok(request);
        }

        request.framing = Framing::from_headers(&mut headers)
            .map_err(ProxyError::bad_request)?
            .unwrap_or(Framing::None);
        if !headers.contains("Host") {
            headers.add("Host", request.target.host_header());
        }
        request.headers = headers;
        request.fold_proxy_headers();

        let (version, keep_alive) = parse_version_keep_alive(minor, &request.headers);
        request.version = version;
        request.keep_alive = keep_alive;

        Ok(request)
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Move `Proxy-Connection` into `Connection` so origins never see it.
    /// Returns true if anything changed.
    pub fn fold_proxy_headers(&mut self) -> bool {
        let Some(value) = self.headers.get("Proxy-Connection").map(str::to_string) else {
            return false;
        };
        self.headers.remove("Proxy-Connection");
        self.headers.replace("Connection", value);
        true
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Attach a response. Fails once the current response's headers have
    /// reached the client.
    pub fn set_response(&mut self, response: Response) -> ProxyResult<()> {
        if self.response.as_ref().is_some_and(Response::headers_sent) {
            return Err(ProxyError::HeadersAlreadySent);
        }
        self.response = Some(response);
        Ok(())
    }

    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    /// Attach the standard blocked page
    pub fn block(&mut self, title: &str, message_html: &str) -> ProxyResult<()> {
        let response = Response::blocked(title, message_html, &self.trigger_html);
        self.set_response(response)
    }

    /// Advisory HTML shown on a blocked page
    pub fn add_trigger_html(&mut self, html: impl Into<String>) {
        self.trigger_html.push(html.into());
    }

    pub fn trigger_html(&self) -> &[String] {
        &self.trigger_html
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Request line in the form the next hop expects, plus headers
    pub fn write_head(&self, buf: &mut BytesMut) {
        let via_http_proxy = matches!(
            &self.upstream_proxy,
            Some(UpstreamProxy {
                kind: UpstreamKind::Http,
                ..
            })
        );
        let target = if self.is_connect() {
            self.target.authority()
        } else if via_http_proxy {
            self.target.to_string()
        } else {
            self.target.path.clone()
        };
        let line = format!(
            "{} {} {}\r\n",
            self.method,
            target,
            version_str(self.version)
        );
        buf.put_slice(line.as_bytes());
        self.headers.write_to(buf);
    }

    /// True for targets the proxy can forward
    pub fn scheme_supported(&self) -> bool {
        matches!(self.target.scheme.as_str(), "http" | "connect")
    }

    /// Error for an unsupported scheme
    pub fn unsupported_scheme(&self) -> ProxyError {
        ProxyError::header(
            StatusCode::NOT_IMPLEMENTED,
            format!("Scheme '{}' is not supported", self.target.scheme),
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.target)
    }
}
