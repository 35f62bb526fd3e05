//! Build-and-run
//!
//! `pack run` builds the app into a throwaway image and immediately runs
//! it, publishing the requested ports. The build uses a uniquely-named
//! cache volume that is removed again when the run ends, so one-shot
//! runs never pollute the per-repository cache.

use crate::build::{BuildConfig, BuildFactory, BuildFlags};
use crate::docker::{self, DockerClient};
use anyhow::{Context, Result, anyhow};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding, PortMap};
use bollard::query_parameters::CreateContainerOptions;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub app_dir: String,
    pub builder: String,
    pub run_image: String,
    /// Comma-separated host ports; empty means the image's exposed ports.
    pub port: String,
}

pub struct RunConfig {
    pub build: BuildConfig,
    pub ports: Vec<u16>,
    docker: DockerClient,
}

impl BuildFactory {
    pub async fn run_config(&self, flags: RunFlags) -> Result<RunConfig> {
        let ports = parse_ports(&flags.port)?;
        let mut build = self
            .build_config(BuildFlags {
                app_dir: flags.app_dir,
                builder: flags.builder,
                run_image: flags.run_image,
                ..Default::default()
            })
            .await?;

        // One-shot volume: unique per invocation, cleaned up afterwards.
        let mut rng = rand::rng();
        let suffix: String = (0..8).map(|_| rng.random_range('a'..='z')).collect();
        build.cache_volume = format!("{}-{suffix}", build.cache_volume);

        Ok(RunConfig {
            build,
            ports,
            docker: self.docker.clone(),
        })
    }
}

impl RunConfig {
    pub async fn run(&self) -> Result<()> {
        let result = self.build_and_run().await;
        let _ = docker::remove_volume(&self.docker, &self.build.cache_volume, true).await;
        result
    }

    async fn build_and_run(&self) -> Result<()> {
        self.build.run().await?;

        let ports = if self.ports.is_empty() {
            self.exposed_ports().await?
        } else {
            self.ports.clone()
        };

        let ctr = self.create_app_container(&ports).await?;
        println!("===> RUNNING");
        for port in &ports {
            println!("Port published: {port}");
        }

        let outcome = tokio::select! {
            result = docker::run_container(&self.docker, &ctr, "app") => {
                result.context("running app container")
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupt received, removing app container");
                Ok(())
            }
        };
        let _ = docker::remove_container(&self.docker, &ctr, true).await;
        outcome
    }

    /// The container ports the built image exposes, as host port numbers.
    async fn exposed_ports(&self) -> Result<Vec<u16>> {
        let inspect = docker::inspect_image(&self.docker, &self.build.repo_name)
            .await?
            .ok_or_else(|| anyhow!("image '{}' does not exist", self.build.repo_name))?;
        let ports = inspect
            .config
            .as_ref()
            .and_then(|c| c.exposed_ports.as_ref())
            .map(|ports| {
                ports
                    .keys()
                    .filter_map(|spec| port_number(spec))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(ports)
    }

    async fn create_app_container(&self, ports: &[u16]) -> Result<String> {
        let mut port_bindings: PortMap = HashMap::new();
        let mut exposed = HashMap::new();
        for port in ports {
            let key = format!("{port}/tcp");
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
            exposed.insert(key, HashMap::new());
        }

        let config = ContainerCreateBody {
            image: Some(self.build.repo_name.clone()),
            exposed_ports: if exposed.is_empty() { None } else { Some(exposed) },
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response = self
            .docker
            .inner()
            .create_container(None::<CreateContainerOptions>, config)
            .await
            .with_context(|| format!("creating container from '{}'", self.build.repo_name))?;
        Ok(response.id)
    }
}

/// Parse a comma-separated port list.
pub fn parse_ports(csv: &str) -> Result<Vec<u16>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .map_err(|_| anyhow!("invalid port: {s}"))
        })
        .collect()
}

/// The numeric part of a `<port>/<proto>` exposure key.
fn port_number(spec: &str) -> Option<u16> {
    spec.split('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ports_splits_csv() {
        assert_eq!(parse_ports("8080,9090").unwrap(), vec![8080, 9090]);
        assert_eq!(parse_ports(" 3000 ").unwrap(), vec![3000]);
        assert!(parse_ports("").unwrap().is_empty());
    }

    #[test]
    fn parse_ports_rejects_garbage() {
        assert!(parse_ports("http").is_err());
        assert!(parse_ports("8080,nope").is_err());
    }

    #[test]
    fn port_number_strips_protocol() {
        assert_eq!(port_number("3000/tcp"), Some(3000));
        assert_eq!(port_number("9090/udp"), Some(9090));
        assert_eq!(port_number("bogus"), None);
    }
}
