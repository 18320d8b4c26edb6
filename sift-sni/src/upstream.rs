//! Minimal SOCKS5 CONNECT client
//!
//! Used to dial tunnel-classified targets through the VPN-side SOCKS
//! endpoint. No-auth subset, DOMAIN addressing so the remote end does
//! the resolving.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;

/// Open a TCP stream to `host:port` through a SOCKS5 proxy.
pub async fn socks_connect(
    proxy: SocketAddr,
    host: &str,
    port: u16,
    dial_timeout: Duration,
) -> Result<TcpStream> {
    if host.len() > u8::MAX as usize {
        return Err(Error::DialFailed {
            target: host.to_string(),
            reason: "hostname too long for SOCKS DOMAIN addressing".into(),
        });
    }

    let mut stream = tokio::time::timeout(dial_timeout, TcpStream::connect(proxy))
        .await
        .map_err(|_| Error::DialFailed {
            target: proxy.to_string(),
            reason: "connect timed out".into(),
        })?
        .map_err(|e| Error::DialFailed {
            target: proxy.to_string(),
            reason: e.to_string(),
        })?;

    // Greeting: no-auth only.
    stream
        .write_all(&[SOCKS_VERSION, 1, AUTH_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::InvalidVersion(choice[0]));
    }
    if choice[1] != AUTH_NO_AUTH {
        return Err(Error::UpstreamRefused(choice[1]));
    }

    // CONNECT with DOMAIN addressing.
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ADDR_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::InvalidVersion(header[0]));
    }
    if header[1] != REPLY_SUCCESS {
        return Err(Error::UpstreamRefused(header[1]));
    }

    // Consume the bind address so the stream starts at payload bytes.
    let skip = match header[3] {
        ADDR_IPV4 => 4 + 2,
        ADDR_IPV6 => 16 + 2,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(Error::InvalidAddressType(other)),
    };
    let mut bind = vec![0u8; skip];
    stream.read_exact(&mut bind).await?;

    Ok(stream)
}
