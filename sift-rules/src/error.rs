//! Error types for rule handling

use thiserror::Error;

/// Result type alias for rule operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when handling rules
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The rule pattern failed validation
    #[error("invalid rule pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl Error {
    pub(crate) fn invalid(pattern: &str, reason: impl Into<String>) -> Self {
        Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}
