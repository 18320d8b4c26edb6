//! Error types for the engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse the configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to serialize state for persistence
    #[error("failed to serialize state: {0}")]
    StateSerialize(#[from] toml::ser::Error),

    /// Rule error
    #[error(transparent)]
    Rules(#[from] sift_rules::Error),

    /// DNS proxy error
    #[error(transparent)]
    Dns(#[from] sift_dns::Error),

    /// SNI proxy error
    #[error(transparent)]
    Sni(#[from] sift_sni::Error),

    /// OS or VPN tool adapter error
    #[error(transparent)]
    Adapter(#[from] sift_system::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine is already running
    #[error("engine is already running")]
    AlreadyRunning,

    /// The engine is not running
    #[error("engine is not running")]
    NotRunning,
}
