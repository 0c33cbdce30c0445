//! Error types for scribe core types
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating or converting domain values
#[derive(Debug, Error)]
pub enum Error {
    /// Utterance fails basic validation (empty ids, confidence out of range)
    #[error("Invalid utterance: {0}")]
    InvalidUtterance(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
