//! Image handles
//!
//! A uniform facade over "image in the local daemon" and "image in a
//! remote registry". Orchestrators mutate a handle in memory (labels,
//! layers, rebase) and materialize the result with `save`, which returns
//! the new image's digest.

pub mod local;
pub mod oci;
pub mod remote;

pub use local::LocalImage;
pub use remote::RemoteImage;

use crate::docker::DockerClient;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Operations shared by both image backings.
#[async_trait]
pub trait Image: Send + Sync {
    /// The reference this handle was opened with.
    fn name(&self) -> &str;

    /// The remote digest, or an empty string when none is known.
    fn digest(&self) -> Result<String>;

    /// A label value; empty string for a missing key, error when the
    /// image does not exist.
    fn label(&self, key: &str) -> Result<String>;

    /// Set a label in memory; persisted by `save`.
    fn set_label(&mut self, key: &str, value: &str) -> Result<()>;

    /// The last diff-id of the root filesystem.
    fn top_layer(&self) -> Result<String>;

    /// Append a tar layer. The diff-id is the sha256 of the uncompressed
    /// stream; gzip blobs are hashed through decompression.
    async fn add_layer(&mut self, tar_path: &Path) -> Result<()>;

    /// Replace the base-image prefix (everything up to and including
    /// `base_top_layer`) with the layers of `new_base`, preserving the
    /// app layers above it.
    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> Result<()>;

    /// Materialize the mutated image and return its digest.
    async fn save(&mut self) -> Result<String>;
}

/// Constructs image handles against a daemon or a registry.
#[derive(Clone)]
pub struct ImageFactory {
    docker: DockerClient,
}

impl ImageFactory {
    pub fn new(docker: DockerClient) -> Self {
        Self { docker }
    }

    /// Open a daemon-backed handle, optionally pulling first. A missing
    /// image yields a handle whose operations error until it exists.
    pub async fn new_local(&self, repo_name: &str, pull: bool) -> Result<LocalImage> {
        LocalImage::open(self.docker.clone(), repo_name, pull).await
    }

    /// Open a registry-backed handle.
    pub async fn new_remote(&self, repo_name: &str) -> Result<RemoteImage> {
        RemoteImage::open(repo_name).await
    }
}
