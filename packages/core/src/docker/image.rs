//! Daemon image pull and inspect helpers

use super::{DockerClient, DockerError};
use bollard::models::ImageInspect;
use bollard::query_parameters::CreateImageOptions;
use futures_util::StreamExt;
use tracing::debug;

/// Check if an image exists in the daemon.
pub async fn image_exists(client: &DockerClient, reference: &str) -> Result<bool, DockerError> {
    debug!("Checking if image exists: {}", reference);

    match client.inner().inspect_image(reference).await {
        Ok(_) => Ok(true),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(false),
        Err(e) => Err(DockerError::from(e)),
    }
}

/// Inspect an image; `Ok(None)` when the image does not exist.
pub async fn inspect_image(
    client: &DockerClient,
    reference: &str,
) -> Result<Option<ImageInspect>, DockerError> {
    match client.inner().inspect_image(reference).await {
        Ok(inspect) => Ok(Some(inspect)),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(None),
        Err(e) => Err(DockerError::Image(format!(
            "failed to inspect image {reference}: {e}"
        ))),
    }
}

/// Pull an image into the daemon, draining the progress stream.
pub async fn pull_image(client: &DockerClient, reference: &str) -> Result<(), DockerError> {
    debug!("Pulling image: {}", reference);

    let options = CreateImageOptions {
        from_image: Some(reference.to_string()),
        ..Default::default()
    };
    let mut stream = client.inner().create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        let info = result
            .map_err(|e| DockerError::Image(format!("failed to pull image '{reference}' : {e}")))?;
        if let Some(error) = info.error {
            return Err(DockerError::Image(format!(
                "failed to pull image '{reference}' : {error}"
            )));
        }
        if let Some(status) = info.status {
            debug!("pull {}: {}", reference, status);
        }
    }

    debug!("Image {} pulled", reference);
    Ok(())
}

/// The root-fs diff-id list of an inspect result.
pub fn rootfs_layers(inspect: &ImageInspect) -> Vec<String> {
    inspect
        .root_fs
        .as_ref()
        .and_then(|fs| fs.layers.clone())
        .unwrap_or_default()
}

/// A label value from an inspect result; empty string when missing.
pub fn label_value(inspect: &ImageInspect, key: &str) -> String {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(key).cloned())
        .unwrap_or_default()
}

/// The `config.env` entries of an inspect result.
pub fn config_env(inspect: &ImageInspect) -> Vec<String> {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.env.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ImageConfig, ImageInspectRootFs};
    use std::collections::HashMap;

    fn inspect_with(labels: HashMap<String, String>, layers: Vec<String>) -> ImageInspect {
        ImageInspect {
            config: Some(ImageConfig {
                labels: Some(labels),
                env: Some(vec!["PACK_USER_ID=1000".to_string()]),
                ..Default::default()
            }),
            root_fs: Some(ImageInspectRootFs {
                layers: Some(layers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn label_value_returns_empty_for_missing_key() {
        let inspect = inspect_with(
            HashMap::from([("mykey".to_string(), "myvalue".to_string())]),
            vec![],
        );
        assert_eq!(label_value(&inspect, "mykey"), "myvalue");
        assert_eq!(label_value(&inspect, "missing"), "");
    }

    #[test]
    fn rootfs_layers_preserves_order() {
        let inspect = inspect_with(
            HashMap::new(),
            vec!["sha256:aaa".to_string(), "sha256:bbb".to_string()],
        );
        assert_eq!(rootfs_layers(&inspect), vec!["sha256:aaa", "sha256:bbb"]);
    }

    #[test]
    fn config_env_defaults_to_empty() {
        let inspect = ImageInspect::default();
        assert!(config_env(&inspect).is_empty());
    }
}
