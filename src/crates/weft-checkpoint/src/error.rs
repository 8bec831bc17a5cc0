//! Error types for checkpoint and channel operations.

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint and channel operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint not found in storage
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("binary serialization error: {0}")]
    Binary(#[from] bincode::Error),

    /// Storage backend error
    #[error("storage error: {0}")]
    Storage(String),

    /// Missing or malformed configuration
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Channel has never been written to
    #[error("channel '{0}' is empty")]
    EmptyChannel(String),

    /// A write the target channel's reducer cannot accept
    #[error("invalid channel update: {0}")]
    InvalidUpdate(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
