//! Ephemeral phase containers
//!
//! Every lifecycle phase is one container: created from the builder
//! image, fed its inputs through the copy endpoint, run to completion
//! with logs streamed out, then removed. The runner reports only the
//! exit code; which argv and binds a phase gets is the orchestrator's
//! business.

use super::{DockerClient, DockerError};
use bollard::body_full;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use futures_util::StreamExt;
use tracing::debug;

/// Everything needed to create one phase container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    /// `volume:/path` bind specs.
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
}

/// Create a container; returns its id. The container is not started.
pub async fn create_container(
    client: &DockerClient,
    spec: ContainerSpec,
) -> Result<String, DockerError> {
    debug!("Creating container from image {} cmd {:?}", spec.image, spec.cmd);

    let host_config = HostConfig {
        binds: Some(spec.binds),
        network_mode: spec.network_mode,
        ..Default::default()
    };

    let config = ContainerCreateBody {
        image: Some(spec.image),
        cmd: Some(spec.cmd),
        user: spec.user,
        env: if spec.env.is_empty() { None } else { Some(spec.env) },
        host_config: Some(host_config),
        ..Default::default()
    };

    let response = client
        .inner()
        .create_container(None::<CreateContainerOptions>, config)
        .await
        .map_err(|e| DockerError::Container(format!("container create: {e}")))?;

    debug!("Container created with ID: {}", response.id);
    Ok(response.id)
}

/// Upload a tar archive into a container, extracted at `/`.
pub async fn copy_to_container(
    client: &DockerClient,
    id: &str,
    tar: Vec<u8>,
) -> Result<(), DockerError> {
    debug!("Copying {} byte archive into container {}", tar.len(), id);

    let options = UploadToContainerOptions {
        path: "/".to_string(),
        ..Default::default()
    };
    client
        .inner()
        .upload_to_container(id, Some(options), body_full(tar.into()))
        .await
        .map_err(|e| DockerError::Container(format!("copy to container: {e}")))?;
    Ok(())
}

/// Start a container, stream its logs prefixed with `[<prefix>]`, and
/// block until it exits. `Ok` only on exit code 0.
pub async fn run_container(
    client: &DockerClient,
    id: &str,
    prefix: &str,
) -> Result<(), DockerError> {
    client
        .inner()
        .start_container(id, None::<StartContainerOptions>)
        .await
        .map_err(|e| DockerError::Container(format!("container start: {e}")))?;

    // Logs are copied concurrently with the wait below; the wait result
    // is what decides success.
    let docker = client.inner().clone();
    let log_id = id.to_string();
    let log_prefix = prefix.to_string();
    let log_task = tokio::spawn(async move {
        let options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = docker.logs(&log_id, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => print_log_output(&log_prefix, output),
                Err(_) => break,
            }
        }
    });

    let status = wait_for_exit(client, id).await?;
    let _ = log_task.await;

    if status != 0 {
        return Err(DockerError::Container(format!(
            "failed with status code: {status}"
        )));
    }
    Ok(())
}

async fn wait_for_exit(client: &DockerClient, id: &str) -> Result<i64, DockerError> {
    let mut wait = client
        .inner()
        .wait_container(id, None::<WaitContainerOptions>);
    match wait.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(DockerError::Container(format!("container wait: {e}"))),
        None => Ok(0),
    }
}

/// Remove a container. With `force`, a running container is killed first.
pub async fn remove_container(
    client: &DockerClient,
    id: &str,
    force: bool,
) -> Result<(), DockerError> {
    debug!("Removing container {} (force={})", id, force);

    let options = RemoveContainerOptions {
        force,
        v: false,
        link: false,
    };
    client
        .inner()
        .remove_container(id, Some(options))
        .await
        .map_err(|e| DockerError::Container(format!("container remove: {e}")))?;
    Ok(())
}

fn print_log_output(prefix: &str, output: LogOutput) {
    let message = match output {
        LogOutput::StdOut { message } | LogOutput::StdErr { message } => message,
        _ => return,
    };
    for line in String::from_utf8_lossy(&message).lines() {
        if !line.is_empty() {
            println!("[{prefix}] {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_spec_defaults_are_empty() {
        let spec = ContainerSpec::default();
        assert!(spec.image.is_empty());
        assert!(spec.cmd.is_empty());
        assert!(spec.user.is_none());
        assert!(spec.env.is_empty());
        assert!(spec.binds.is_empty());
        assert!(spec.network_mode.is_none());
    }

    #[test]
    fn nonzero_exit_error_text() {
        let err = DockerError::Container(format!("failed with status code: {}", 6));
        assert_eq!(err.to_string(), "failed with status code: 6");
    }
}
