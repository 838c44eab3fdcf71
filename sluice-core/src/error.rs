//! Error types for decoding data received from the gate

use thiserror::Error;

/// Result type alias for core decoding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while decoding tasks, pipeline configuration or credentials
#[derive(Debug, Error)]
pub enum Error {
    /// The gate sent a task kind this runner does not understand
    #[error("unknown task kind: {0}")]
    UnknownTaskKind(String),

    /// A task payload did not match its declared kind
    #[error("malformed {kind} payload: {source}")]
    MalformedTask {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The pipeline configuration document could not be decoded
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(#[from] serde_yaml::Error),

    /// A Docker-auth style credential blob could not be decoded
    #[error("invalid registry credentials: {0}")]
    InvalidAuth(String),
}
