//! Buffered socket wrapper used for header reads, body framing and
//! liveness probing.
//!
//! Reads land in an internal buffer so a header parse never consumes bytes
//! that belong to the body or to the next message. Writes pass straight
//! through to the inner stream. Both directions are counted.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{ProxyError, ProxyResult};

/// Initial capacity for the read buffer
const INITIAL_CAPACITY: usize = 8 * 1024;

/// What a non-blocking probe found on an idle socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Alive,
    Closed,
    /// Unsolicited bytes were waiting (and have been discarded)
    Trailing(usize),
}

pub struct BufferedStream<S> {
    inner: S,
    buf: BytesMut,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> BufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Unconsumed buffered bytes
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Remove and return everything buffered so far
    pub fn take_buffer(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Total bytes pulled from the inner stream
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Total bytes written to the inner stream
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Returns the still-buffered bytes and the inner stream
    pub fn into_parts(self) -> (Bytes, S) {
        (self.buf.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Buffer more data from the inner stream. Returns 0 on EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        if self.buf.capacity() - self.buf.len() < 1024 {
            self.buf.reserve(INITIAL_CAPACITY);
        }
        let n = self.inner.read_buf(&mut self.buf).await?;
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Take exactly `n` bytes, reading more as needed
    pub async fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", self.buf.len(), n),
                ));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read one header block up to and including its blank line.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly before sending any
    /// byte of a new message. Empty lines ahead of the start line are
    /// skipped. Both `\r\n` and bare `\n` line endings are accepted.
    pub async fn read_header_block(&mut self, max_size: usize) -> ProxyResult<Option<Bytes>> {
        let mut scanned = 0;
        loop {
            let leading = self
                .buf
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            if leading > 0 {
                let _ = self.buf.split_to(leading);
                scanned = 0;
            }

            if let Some(end) = find_header_end(&self.buf, scanned) {
                if end > max_size {
                    return Err(ProxyError::HeaderTooLarge { limit: max_size });
                }
                return Ok(Some(self.buf.split_to(end).freeze()));
            }
            if self.buf.len() > max_size {
                return Err(ProxyError::HeaderTooLarge { limit: max_size });
            }
            scanned = self.buf.len().saturating_sub(2);

            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ProxyError::IncompleteHeader)
                };
            }
        }
    }
}

impl BufferedStream<TcpStream> {
    /// Check an idle connection without waiting.
    ///
    /// Anything already buffered or waiting in the socket counts as
    /// trailing data and is discarded. Readiness is only as fresh as the
    /// reactor's last turn, so the pool probes idle connections again
    /// before handing them out.
    pub fn probe(&mut self) -> SocketState {
        let mut trailing = self.buf.len();
        self.buf.clear();

        let mut scratch = [0u8; 4096];
        loop {
            match self.inner.try_read(&mut scratch) {
                Ok(0) => return SocketState::Closed,
                Ok(n) => {
                    self.bytes_read += n as u64;
                    trailing += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return SocketState::Closed,
            }
        }

        if trailing > 0 {
            SocketState::Trailing(trailing)
        } else {
            SocketState::Alive
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = &poll {
            self.bytes_written += *n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Offset just past the first blank line, searching from `from`
pub(crate) fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some(i + 2),
                (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}
