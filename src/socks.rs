//! SOCKS5 client handshake used when a request is chained through a
//! `socks://` upstream.
//!
//! Only the no-authentication method and the CONNECT command with a
//! domain-name address are spoken. The reply's bound address is always
//! drained so the tunnel starts exactly at the first payload byte.

use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::http::BufferedStream;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("upstream is not a SOCKS5 server (version {0})")]
    Version(u8),

    #[error("upstream requires an unsupported authentication method ({0:#04x})")]
    Method(u8),

    #[error("host name too long for SOCKS5 ({0} bytes)")]
    HostTooLong(usize),

    #[error("{message} (reply {code})")]
    Reply { code: u8, message: &'static str },

    #[error("unknown address type {0} in reply")]
    AddressType(u8),

    #[error("SOCKS5 handshake failed: {0}")]
    Io(#[from] io::Error),
}

impl SocksError {
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            SocksError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Human readable text for a non-zero reply code
pub fn reply_message(code: u8) -> &'static str {
    match code {
        1 => "general SOCKS server failure",
        2 => "Connection not allowed by ruleset",
        3 => "Network unreachable",
        4 => "Host unreachable",
        5 => "Connection refused",
        6 => "TTL expired",
        7 => "Command not supported",
        8 => "Address type not supported",
        _ => "unknown SOCKS error",
    }
}

/// Ask the SOCKS5 server on the other end of `stream` to connect to
/// `host:port`. On success the stream carries the tunneled bytes.
pub async fn socks5_connect<S>(
    stream: &mut BufferedStream<S>,
    host: &str,
    port: u16,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.len() > u8::MAX as usize {
        return Err(SocksError::HostTooLong(host.len()));
    }

    stream.write_all(&[SOCKS_VERSION, 1, AUTH_NONE]).await?;
    stream.flush().await?;

    let choice = stream.read_bytes(2).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SocksError::Version(choice[0]));
    }
    if choice[1] != AUTH_NONE {
        return Err(SocksError::Method(choice[1]));
    }

    let mut frame = BytesMut::with_capacity(7 + host.len());
    frame.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8]);
    frame.extend_from_slice(host.as_bytes());
    frame.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let reply = stream.read_bytes(4).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::Version(reply[0]));
    }

    // The bound address is drained even on failure
    let address_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_bytes(1).await?[0] as usize,
        other => return Err(SocksError::AddressType(other)),
    };
    stream.read_bytes(address_len + 2).await?;

    if reply[1] != 0 {
        return Err(SocksError::Reply {
            code: reply[1],
            message: reply_message(reply[1]),
        });
    }

    debug!(host = %host, port, "[SOCKS] Connected through upstream");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// Answers one handshake with the given reply code and bound address
    async fn serve(mut server: DuplexStream, code: u8, bound: Vec<u8>) -> Vec<u8> {
        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        server.write_all(&[5, 0]).await.unwrap();

        let mut head = [0u8; 5];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[5, 1, 0, 3]);
        let mut rest = vec![0u8; head[4] as usize + 2];
        server.read_exact(&mut rest).await.unwrap();

        let mut reply = vec![5, code, 0];
        reply.extend_from_slice(&bound);
        server.write_all(&reply).await.unwrap();
        server.write_all(b"payload").await.unwrap();
        rest
    }

    #[tokio::test]
    async fn test_successful_handshake_leaves_payload() {
        let (client, server) = duplex(1024);
        let origin = tokio::spawn(serve(server, 0, vec![1, 10, 0, 0, 1, 0x1f, 0x90]));

        let mut stream = BufferedStream::new(client);
        socks5_connect(&mut stream, "example.com", 443).await.unwrap();

        let requested = origin.await.unwrap();
        assert_eq!(&requested[..11], b"example.com");
        assert_eq!(&requested[11..], &443u16.to_be_bytes());

        let payload = stream.read_bytes(7).await.unwrap();
        assert_eq!(&payload[..], b"payload");
    }

    #[tokio::test]
    async fn test_domain_bound_address_is_drained() {
        let (client, server) = duplex(1024);
        let mut bound = vec![3, 4];
        bound.extend_from_slice(b"host");
        bound.extend_from_slice(&[0, 80]);
        tokio::spawn(serve(server, 0, bound));

        let mut stream = BufferedStream::new(client);
        socks5_connect(&mut stream, "example.com", 80).await.unwrap();
        assert_eq!(&stream.read_bytes(7).await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn test_connection_refused_reply() {
        let (client, server) = duplex(1024);
        tokio::spawn(serve(server, 5, vec![1, 0, 0, 0, 0, 0, 0]));

        let mut stream = BufferedStream::new(client);
        let err = socks5_connect(&mut stream, "example.com", 80).await.unwrap_err();
        assert_eq!(err.reply_code(), Some(5));
        assert!(err.to_string().contains("Connection refused"));

        let err = crate::error::ProxyError::from(err);
        assert!(err.status_code().is_server_error());
    }

    #[tokio::test]
    async fn test_auth_required_is_rejected() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 0xff]).await.unwrap();
        });

        let mut stream = BufferedStream::new(client);
        let err = socks5_connect(&mut stream, "example.com", 80).await.unwrap_err();
        assert!(matches!(err, SocksError::Method(0xff)));
    }

    #[tokio::test]
    async fn test_early_close_is_io_error() {
        let (client, server) = duplex(1024);
        drop(server);
        let mut stream = BufferedStream::new(client);
        let err = socks5_connect(&mut stream, "example.com", 80).await.unwrap_err();
        assert!(matches!(err, SocksError::Io(_)));
    }

    #[test]
    fn test_reply_messages() {
        assert_eq!(reply_message(2), "Connection not allowed by ruleset");
        assert_eq!(reply_message(6), "TTL expired");
        assert_eq!(reply_message(42), "unknown SOCKS error");
    }
}
