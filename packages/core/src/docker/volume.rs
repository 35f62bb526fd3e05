//! Cache volume management
//!
//! The cache volume carries all inter-phase state of a build. Its name
//! is derived deterministically from the target repository so that
//! consecutive builds of the same image coalesce on one volume; nothing
//! time- or pid-dependent may enter the name.

use super::{DockerClient, DockerError};
use bollard::models::VolumeCreateOptions;
use bollard::query_parameters::RemoveVolumeOptions;
use std::collections::HashMap;
use tracing::debug;

/// The deterministic cache volume name for a repository.
pub fn cache_volume_name(repo_name: &str) -> String {
    format!("pack-cache-{:x}", md5::compute(repo_name))
}

/// Create a volume if it does not already exist. Idempotent.
pub async fn ensure_volume(client: &DockerClient, name: &str) -> Result<(), DockerError> {
    debug!("Ensuring volume exists: {}", name);

    let options = VolumeCreateOptions {
        name: Some(name.to_string()),
        driver: Some("local".to_string()),
        driver_opts: Some(HashMap::new()),
        labels: Some(HashMap::from([(
            "managed-by".to_string(),
            "pack".to_string(),
        )])),
        cluster_volume_spec: None,
    };
    client
        .inner()
        .create_volume(options)
        .await
        .map_err(|e| DockerError::Volume(format!("Failed to create volume {name}: {e}")))?;
    Ok(())
}

/// Remove a volume. Missing volumes are not an error when `force` is set.
pub async fn remove_volume(
    client: &DockerClient,
    name: &str,
    force: bool,
) -> Result<(), DockerError> {
    debug!("Removing volume: {} (force={})", name, force);

    let options = RemoveVolumeOptions { force };
    match client.inner().remove_volume(name, Some(options)).await {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) if force => Ok(()),
        Err(e) => Err(DockerError::Volume(format!(
            "Failed to remove volume {name}: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_volume_name_is_deterministic() {
        let first = cache_volume_name("some/app");
        let second = cache_volume_name("some/app");
        assert_eq!(first, second);
        assert!(first.starts_with("pack-cache-"));
    }

    #[test]
    fn cache_volume_name_differs_per_repo() {
        assert_ne!(cache_volume_name("some/app"), cache_volume_name("other/app"));
    }

    #[test]
    fn cache_volume_name_has_no_reference_characters() {
        let name = cache_volume_name("registry.com:5000/some/app:latest");
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }
}
