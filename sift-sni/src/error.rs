//! Error types for the SNI proxy

use thiserror::Error;

/// Result type alias for SNI proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the SNI proxy
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to bind the listening socket; fatal for the proxy
    #[error("failed to bind SNI proxy to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Client did not speak SOCKS5
    #[error("invalid SOCKS version {0:#04x}")]
    InvalidVersion(u8),

    /// Only CONNECT is supported
    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    /// Unknown address type in the request
    #[error("invalid SOCKS address type {0:#04x}")]
    InvalidAddressType(u8),

    /// Handshake read exceeded its deadline
    #[error("SOCKS handshake timed out")]
    HandshakeTimeout,

    /// Outbound dial failed or timed out
    #[error("failed to reach {target}: {reason}")]
    DialFailed { target: String, reason: String },

    /// The upstream SOCKS refused the request
    #[error("upstream SOCKS replied {0:#04x}")]
    UpstreamRefused(u8),

    /// The proxy is already running
    #[error("SNI proxy is already running")]
    AlreadyRunning,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
