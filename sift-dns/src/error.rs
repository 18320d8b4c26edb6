//! Error types for the DNS proxy

use thiserror::Error;

/// Result type alias for DNS proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the DNS proxy
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to bind the listening socket; fatal for the proxy
    #[error("failed to bind DNS proxy to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Malformed DNS packet
    #[error("failed to decode DNS packet: {0}")]
    Decode(String),

    /// Upstream did not answer within the timeout
    #[error("upstream {0} timed out")]
    UpstreamTimeout(std::net::SocketAddr),

    /// Upstream socket error
    #[error("upstream {addr} error: {source}")]
    Upstream {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// The proxy is already running
    #[error("DNS proxy is already running")]
    AlreadyRunning,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
