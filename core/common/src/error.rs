//! Common error types for the cloud save engine.

use thiserror::Error;

/// Top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Target identifier or target path rejected.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// A sync for this target is already in flight.
    #[error("Sync already running for target {0}")]
    AlreadyRunning(String),

    /// Operation not supported for this target.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The authentication port is held by another process.
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    /// The external tool could not be started.
    #[error("Failed to spawn external tool: {0}")]
    Spawn(String),

    /// Configuration could not be read or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
