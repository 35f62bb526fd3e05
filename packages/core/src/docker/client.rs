//! Docker client wrapper
//!
//! Wraps a bollard connection so the rest of the crate never constructs
//! one directly. `DOCKER_HOST` is honored by bollard's local defaults.

use super::DockerError;
use bollard::Docker;
use tracing::debug;

/// A connected Docker client.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect using local defaults (unix socket, or `DOCKER_HOST`).
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::Connection(format!("Failed to connect to Docker: {e}")))?;
        Ok(Self { docker })
    }

    /// Access the underlying bollard client.
    pub fn inner(&self) -> &Docker {
        &self.docker
    }

    /// Verify the daemon answers a ping.
    pub async fn verify_connection(&self) -> Result<(), DockerError> {
        debug!("Pinging Docker daemon");
        self.docker.ping().await.map_err(DockerError::from)?;
        Ok(())
    }
}
