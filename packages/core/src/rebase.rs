//! Rebase orchestration
//!
//! Swaps the run image underneath a previously built app image without
//! re-running any buildpack. The target's lifecycle metadata label names
//! the run image it was built against and the diff-id of that base's top
//! layer; everything above that pivot is preserved verbatim.

use crate::config::{ConfigStore, image_by_registry};
use crate::docker::DockerClient;
use crate::image::{Image, ImageFactory};
use crate::reference::registry_of;
use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

/// Label the exporter writes onto every app image.
pub const LIFECYCLE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleMetadata {
    #[serde(rename = "runImage", alias = "run_image")]
    pub run_image: RunImageMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunImageMetadata {
    pub name: String,
    pub sha: String,
}

/// Parse the lifecycle metadata label of an app image.
pub fn parse_lifecycle_metadata(text: &str) -> Result<LifecycleMetadata> {
    if text.is_empty() {
        bail!("image has no {LIFECYCLE_METADATA_LABEL} label");
    }
    serde_json::from_str(text)
        .with_context(|| format!("parsing {LIFECYCLE_METADATA_LABEL} label"))
}

#[derive(Debug, Clone, Default)]
pub struct RebaseFlags {
    pub repo_name: String,
    pub publish: bool,
    pub no_pull: bool,
}

pub struct RebaseFactory {
    pub docker: DockerClient,
    pub config: ConfigStore,
    pub images: ImageFactory,
}

impl RebaseFactory {
    pub fn new(docker: DockerClient, config: ConfigStore) -> Self {
        let images = ImageFactory::new(docker.clone());
        Self {
            docker,
            config,
            images,
        }
    }

    pub async fn rebase(&self, flags: RebaseFlags) -> Result<String> {
        let repo_name = &flags.repo_name;

        let mut target: Box<dyn Image> = if flags.publish {
            Box::new(self.images.new_remote(repo_name).await?)
        } else {
            Box::new(self.images.new_local(repo_name, !flags.no_pull).await?)
        };

        let metadata = parse_lifecycle_metadata(&target.label(LIFECYCLE_METADATA_LABEL)?)
            .with_context(|| format!("rebase {repo_name}"))?;

        let new_run_image = self.select_run_image(&metadata.run_image.name, repo_name)?;
        println!("Rebasing {repo_name} on run image {new_run_image}");

        let new_base: Box<dyn Image> = if flags.publish {
            Box::new(self.images.new_remote(&new_run_image).await?)
        } else {
            Box::new(self.images.new_local(&new_run_image, !flags.no_pull).await?)
        };

        target
            .rebase(&metadata.run_image.sha, new_base.as_ref())
            .await?;
        let digest = target.save().await?;

        println!("Successfully rebased image: {repo_name}");
        Ok(digest)
    }

    /// The replacement run image: from the stack the old run image
    /// belongs to, preferring the entry on the target's registry.
    fn select_run_image(&self, old_run_image: &str, repo_name: &str) -> Result<String> {
        let stack = self
            .config
            .stack_by_run_image(old_run_image)
            .ok_or_else(|| {
                anyhow!(
                    r#"run image "{old_run_image}" is not part of any stack in pack config.toml"#
                )
            })?;
        image_by_registry(&registry_of(repo_name), &stack.run_images)
    }
}
