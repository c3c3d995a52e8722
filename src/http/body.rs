//! Body framing selection and relaying.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::chunked::relay_chunked;
use super::headers::HttpHeaders;
use super::stream::BufferedStream;
use crate::error::{ProxyError, ProxyResult};

/// How a message body is delimited. Exactly one applies to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all
    None,
    /// `Content-Length: N`
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Read until the peer closes
    UntilClose,
}

impl Framing {
    /// Body end is known without the peer closing the connection
    pub fn is_delimited(&self) -> bool {
        !matches!(self, Framing::UntilClose)
    }

    pub fn has_body(&self) -> bool {
        match self {
            Framing::None | Framing::Length(0) => false,
            _ => true,
        }
    }

    /// Declared length, -1 when unknown
    pub fn content_length(&self) -> i64 {
        match self {
            Framing::None => 0,
            Framing::Length(n) => *n as i64,
            Framing::Chunked | Framing::UntilClose => -1,
        }
    }

    /// Framing declared by a message's headers.
    ///
    /// Chunked wins over Content-Length, and the stale Content-Length is
    /// dropped so only one framing is ever forwarded. Conflicting
    /// Content-Length values are rejected.
    pub fn from_headers(headers: &mut HttpHeaders) -> Result<Option<Framing>, String> {
        if headers.has_token("Transfer-Encoding", "chunked") {
            headers.remove("Content-Length");
            return Ok(Some(Framing::Chunked));
        }

        let lengths = headers.get_all("Content-Length");
        let Some(first) = lengths.first() else {
            return Ok(None);
        };
        let length: u64 = first
            .trim()
            .parse()
            .map_err(|_| format!("Invalid Content-Length '{}'", first))?;
        if lengths.iter().any(|l| l.trim() != first.trim()) {
            return Err("Conflicting Content-Length headers".to_string());
        }
        Ok(Some(Framing::Length(length)))
    }
}

/// Copy one body from `src` to `dst` according to `framing`.
///
/// Returns the number of payload bytes relayed. Bytes beyond the body
/// stay buffered in `src`.
pub async fn relay_body<R, W>(
    framing: Framing,
    src: &mut BufferedStream<R>,
    dst: &mut W,
) -> ProxyResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let relayed = match framing {
        Framing::None => 0,
        Framing::Length(expected) => relay_exact(expected, src, dst).await?,
        Framing::Chunked => relay_chunked(src, dst).await?,
        Framing::UntilClose => relay_to_eof(src, dst).await?,
    };
    dst.flush().await?;
    Ok(relayed)
}

async fn relay_exact<R, W>(expected: u64, src: &mut BufferedStream<R>, dst: &mut W) -> ProxyResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = expected;
    while remaining > 0 {
        if !src.has_buffered() && src.fill().await? == 0 {
            return Err(ProxyError::ShortBody {
                expected,
                received: expected - remaining,
            });
        }
        let n = remaining.min(src.buffer().len() as u64) as usize;
        let piece = src.buffer_mut().split_to(n);
        dst.write_all(&piece).await?;
        remaining -= n as u64;
    }
    Ok(expected)
}

async fn relay_to_eof<R, W>(src: &mut BufferedStream<R>, dst: &mut W) -> ProxyResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        if src.has_buffered() {
            let piece = src.take_buffer();
            dst.write_all(&piece).await?;
            total += piece.len() as u64;
        }
        if src.fill().await? == 0 {
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn headers(lines: &[(&str, &str)]) -> HttpHeaders {
        let mut h = HttpHeaders::new();
        for (k, v) in lines {
            h.add(k, *v);
        }
        h
    }

    #[test]
    fn test_framing_from_headers() {
        assert_eq!(Framing::from_headers(&mut headers(&[])), Ok(None));
        assert_eq!(
            Framing::from_headers(&mut headers(&[("Content-Length", "5")])),
            Ok(Some(Framing::Length(5)))
        );
        assert_eq!(
            Framing::from_headers(&mut headers(&[("Transfer-Encoding", "chunked")])),
            Ok(Some(Framing::Chunked))
        );
    }

    #[test]
    fn test_chunked_overrides_content_length() {
        let mut h = headers(&[("Content-Length", "10"), ("Transfer-Encoding", "chunked")]);
        assert_eq!(Framing::from_headers(&mut h), Ok(Some(Framing::Chunked)));
        assert!(!h.contains("Content-Length"));
    }

    #[test]
    fn test_invalid_and_conflicting_lengths() {
        assert!(Framing::from_headers(&mut headers(&[("Content-Length", "abc")])).is_err());
        assert!(Framing::from_headers(&mut headers(&[
            ("Content-Length", "5"),
            ("Content-Length", "6")
        ]))
        .is_err());
        assert_eq!(
            Framing::from_headers(&mut headers(&[
                ("Content-Length", "5"),
                ("Content-Length", "5")
            ])),
            Ok(Some(Framing::Length(5)))
        );
    }

    #[test]
    fn test_framing_metadata() {
        assert_eq!(Framing::Length(7).content_length(), 7);
        assert_eq!(Framing::Chunked.content_length(), -1);
        assert!(!Framing::UntilClose.is_delimited());
        assert!(!Framing::Length(0).has_body());
        assert!(Framing::Chunked.has_body());
    }

    #[tokio::test]
    async fn test_relay_exact_length_leaves_rest() {
        let mut src = BufferedStream::new(Cursor::new(b"helloGET".to_vec()));
        let mut dst = Vec::new();
        let n = relay_body(Framing::Length(5), &mut src, &mut dst).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(dst, b"hello");
        assert_eq!(src.buffer(), b"GET");
    }

    #[tokio::test]
    async fn test_relay_short_body() {
        let mut src = BufferedStream::new(Cursor::new(b"hel".to_vec()));
        let mut dst = Vec::new();
        let err = relay_body(Framing::Length(5), &mut src, &mut dst)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::ShortBody {
                expected: 5,
                received: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_relay_until_close() {
        let mut src = BufferedStream::new(Cursor::new(b"streamed until eof".to_vec()));
        let mut dst = Vec::new();
        let n = relay_body(Framing::UntilClose, &mut src, &mut dst)
            .await
            .unwrap();
        assert_eq!(n, 18);
        assert_eq!(dst, b"streamed until eof");
    }

    #[tokio::test]
    async fn test_zero_length_body_is_empty() {
        let mut src = BufferedStream::new(Cursor::new(b"next".to_vec()));
        let mut dst = Vec::new();
        assert_eq!(
            relay_body(Framing::Length(0), &mut src, &mut dst).await.unwrap(),
            0
        );
        assert!(dst.is_empty());
    }
}
