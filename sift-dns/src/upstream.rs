//! Upstream DNS exchange
//!
//! One ephemeral UDP socket per query keeps the original datagram's
//! id space untouched and needs no response demultiplexing.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Maximum UDP DNS response size we accept
const MAX_RESPONSE_SIZE: usize = 4096;

/// Forward a raw DNS query to an upstream server and await the reply.
///
/// The query bytes are sent verbatim. Times out with
/// [`Error::UpstreamTimeout`] after `timeout`.
pub async fn exchange(upstream: SocketAddr, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::Upstream {
            addr: upstream,
            source: e,
        })?;

    // Connecting filters responses to the queried server and lets the
    // kernel surface ICMP errors.
    socket.connect(upstream).await.map_err(|e| Error::Upstream {
        addr: upstream,
        source: e,
    })?;

    socket.send(query).await.map_err(|e| Error::Upstream {
        addr: upstream,
        source: e,
    })?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::UpstreamTimeout(upstream))?
        .map_err(|e| Error::Upstream {
            addr: upstream,
            source: e,
        })?;

    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..len], src).await.unwrap();
        });

        let reply = exchange(server_addr, b"hello-dns", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"hello-dns");
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        // Bound but never answered.
        let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = blackhole.local_addr().unwrap();

        let result = exchange(addr, b"query", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::UpstreamTimeout(_))));
    }
}
