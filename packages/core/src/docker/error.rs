//! Docker-specific error types

use thiserror::Error;

/// Errors surfaced by Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The daemon socket exists but nothing is listening.
    #[error("Docker is not running")]
    NotRunning,

    /// The daemon refused the connection for permission reasons.
    #[error("permission denied accessing Docker")]
    PermissionDenied,

    /// Could not reach the daemon at all.
    #[error("Docker connection error: {0}")]
    Connection(String),

    /// A container operation failed.
    #[error("{0}")]
    Container(String),

    /// An image operation failed.
    #[error("{0}")]
    Image(String),

    /// A volume operation failed.
    #[error("{0}")]
    Volume(String),
}

impl From<bollard::errors::Error> for DockerError {
    fn from(err: bollard::errors::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("permission denied") {
            DockerError::PermissionDenied
        } else if msg.contains("connection refused") || msg.contains("No such file or directory") {
            DockerError::NotRunning
        } else {
            DockerError::Connection(msg)
        }
    }
}
