//! Error types for the OS adapters

use thiserror::Error;

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when driving external tools
#[derive(Debug, Error)]
pub enum Error {
    /// An external command exited non-zero
    #[error("{program} failed: {stderr}")]
    Command { program: String, stderr: String },

    /// The control tool's output could not be parsed
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    /// The VPN interface/peer target has not been configured
    #[error("no VPN interface/peer configured")]
    NotConfigured,

    /// The requested interface or peer does not exist
    #[error("interface or peer not found: {0}")]
    NotFound(String),

    /// This platform has no DNS redirection backend
    #[error("unsupported platform for system DNS redirection")]
    UnsupportedPlatform,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
