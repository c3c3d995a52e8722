//! Chunked transfer-coding.
//!
//! [`ChunkedDecoder`] is a push parser over a `BytesMut`: it never reads
//! past the final CRLF of the message, so whatever follows stays in the
//! buffer for the next message. [`ChunkedWriter`] frames every write as
//! one chunk and ends the body with a zero-length chunk.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::stream::BufferedStream;
use crate::error::{ProxyError, ProxyResult};

/// Longest size or trailer line accepted
pub const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Data(Bytes),
    /// One trailer header line, without its line ending
    Trailer(Bytes),
    End,
}

#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecodeState,
    max_line: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new(MAX_CHUNK_LINE)
    }
}

impl ChunkedDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            state: DecodeState::Size,
            max_line,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Consume from `buf` until one event is complete.
    ///
    /// `Ok(None)` means more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ProxyResult<Option<ChunkEvent>> {
        loop {
            match self.state {
                DecodeState::Size => {
                    let Some(line) = self.take_line(buf)? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        DecodeState::Trailer
                    } else {
                        DecodeState::Data(size)
                    };
                }
                DecodeState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(n).freeze();
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        DecodeState::DataEnd
                    } else {
                        DecodeState::Data(left)
                    };
                    return Ok(Some(ChunkEvent::Data(data)));
                }
                DecodeState::DataEnd => match buf.first() {
                    None => return Ok(None),
                    Some(b'\n') => {
                        let _ = buf.split_to(1);
                        self.state = DecodeState::Size;
                    }
                    Some(b'\r') => match buf.get(1) {
                        None => return Ok(None),
                        Some(b'\n') => {
                            let _ = buf.split_to(2);
                            self.state = DecodeState::Size;
                        }
                        Some(_) => {
                            return Err(ProxyError::ChunkDesync(
                                "missing CRLF after chunk data".to_string(),
                            ))
                        }
                    },
                    Some(_) => {
                        return Err(ProxyError::ChunkDesync(
                            "chunk data longer than declared size".to_string(),
                        ))
                    }
                },
                DecodeState::Trailer => {
                    let Some(line) = self.take_line(buf)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = DecodeState::Done;
                        return Ok(Some(ChunkEvent::End));
                    }
                    return Ok(Some(ChunkEvent::Trailer(line)));
                }
                DecodeState::Done => return Ok(Some(ChunkEvent::End)),
            }
        }
    }

    /// Split one line off the front of `buf`, without its line ending
    fn take_line(&self, buf: &mut BytesMut) -> ProxyResult<Option<Bytes>> {
        match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let mut line = buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Ok(Some(line.freeze()))
            }
            None if buf.len() > self.max_line => Err(ProxyError::ChunkDesync(format!(
                "chunk line exceeds {} bytes",
                self.max_line
            ))),
            None => Ok(None),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> ProxyResult<u64> {
    // Chunk extensions follow a ';' and are ignored
    let size = line.split(|b| *b == b';').next().unwrap_or_default();
    let text = std::str::from_utf8(size)
        .map(str::trim)
        .map_err(|_| ProxyError::ChunkDesync("chunk size is not ASCII".to_string()))?;
    if text.is_empty() {
        return Err(ProxyError::ChunkDesync("empty chunk size line".to_string()));
    }
    u64::from_str_radix(text, 16)
        .map_err(|_| ProxyError::ChunkDesync(format!("invalid chunk size '{}'", text)))
}

/// Append one chunk frame. Empty input writes nothing, since a
/// zero-length chunk would end the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    let size = format!("{:x}\r\n", data.len());
    out.reserve(size.len() + data.len() + 2);
    out.put_slice(size.as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Append the terminating chunk with optional trailer lines
pub fn encode_end(trailers: &[Bytes], out: &mut BytesMut) {
    out.put_slice(b"0\r\n");
    for line in trailers {
        out.put_slice(line);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
}

/// Chunked output over any writer
pub struct ChunkedWriter<'a, W> {
    inner: &'a mut W,
    frame: BytesMut,
    written: u64,
}

impl<'a, W: AsyncWrite + Unpin> ChunkedWriter<'a, W> {
    pub fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            frame: BytesMut::with_capacity(8 * 1024),
            written: 0,
        }
    }

    /// Send `data` as one chunk
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.frame.clear();
        encode_chunk(data, &mut self.frame);
        self.inner.write_all(&self.frame).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Send the terminator and flush. Returns the payload bytes written.
    pub async fn finish(mut self, trailers: &[Bytes]) -> std::io::Result<u64> {
        self.frame.clear();
        encode_end(trailers, &mut self.frame);
        self.inner.write_all(&self.frame).await?;
        self.inner.flush().await?;
        Ok(self.written)
    }
}

/// Decode a chunked body from `src` and re-encode it onto `dst`,
/// forwarding trailers. Returns the payload size.
pub async fn relay_chunked<R, W>(src: &mut BufferedStream<R>, dst: &mut W) -> ProxyResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = ChunkedDecoder::default();
    let mut writer = ChunkedWriter::new(dst);
    let mut trailers = Vec::new();

    loop {
        match decoder.decode(src.buffer_mut())? {
            Some(ChunkEvent::Data(data)) => writer.write(&data).await?,
            Some(ChunkEvent::Trailer(line)) => trailers.push(line),
            Some(ChunkEvent::End) => return Ok(writer.finish(&trailers).await?),
            None => {
                if src.fill().await? == 0 {
                    return Err(ProxyError::ChunkDesync(
                        "connection closed inside chunked body".to_string(),
                    ));
                }
            }
        }
    }
}
