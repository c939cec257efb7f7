//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the warden runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or argument errors (zero capacity, non-zero splice start).
    #[error("validation error: {0}")]
    Validation(String),

    /// A size probe or metrics read failed for this cycle.
    #[error("probe error: {0}")]
    Probe(String),

    /// The host transport rejected a send or invoke.
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal errors, including panics recovered from host callbacks.
    #[error("internal error: {0}")]
    Internal(String),

    /// Deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
