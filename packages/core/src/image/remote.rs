//! Registry-backed image handle
//!
//! Backed by the OCI distribution API: inspect is a manifest + config
//! blob fetch, save uploads config, layer blobs and a fresh manifest.
//! Layer blobs the handle did not produce locally are pulled from their
//! origin registry on demand, so a rebase never round-trips blobs that
//! the target registry already has under the same repository.

use super::Image;
use super::oci::{ConfigFile, base_layer_count, merge_rebase_config, splice_diff_ids};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_distribution::Reference;
use oci_distribution::client::{Client, ClientConfig, Config as PushConfig, ImageLayer};
use oci_distribution::manifest::{
    IMAGE_CONFIG_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE, OciDescriptor, OciImageManifest,
};
use oci_distribution::secrets::RegistryAuth;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a layer blob comes from at save time.
enum LayerSource {
    /// Already in a registry; fetched on demand.
    Fetched {
        origin: Reference,
        descriptor: OciDescriptor,
    },
    /// Produced locally; uploaded on save.
    Local {
        path: PathBuf,
        descriptor: OciDescriptor,
    },
}

impl LayerSource {
    fn descriptor(&self) -> &OciDescriptor {
        match self {
            LayerSource::Fetched { descriptor, .. } => descriptor,
            LayerSource::Local { descriptor, .. } => descriptor,
        }
    }
}

struct RemoteState {
    config: ConfigFile,
    /// Parallel to `config.rootfs.diff_ids`.
    layers: Vec<LayerSource>,
    manifest_digest: String,
}

pub struct RemoteImage {
    client: Client,
    repo_name: String,
    reference: Reference,
    state: Option<RemoteState>,
}

impl RemoteImage {
    pub(super) async fn open(repo_name: &str) -> Result<Self> {
        let reference: Reference = repo_name
            .parse()
            .with_context(|| format!("parsing image reference '{repo_name}'"))?;
        let client = Client::new(ClientConfig::default());

        let state = match fetch_state(&client, &reference).await {
            Ok(state) => Some(state),
            Err(e) => {
                // Missing image and auth failures both surface here; the
                // handle stays usable for existence checks.
                debug!("Image {} not readable from registry: {e:#}", repo_name);
                None
            }
        };

        Ok(Self {
            client,
            repo_name: repo_name.to_string(),
            reference,
            state,
        })
    }

    /// Retarget where `save` pushes, keeping the inspected state.
    pub fn with_repo_name(mut self, repo_name: &str) -> Result<Self> {
        self.reference = repo_name
            .parse()
            .with_context(|| format!("parsing image reference '{repo_name}'"))?;
        self.repo_name = repo_name.to_string();
        Ok(self)
    }

    /// Whether the image was readable when the handle was opened.
    pub fn found(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self, op: &str) -> Result<&RemoteState> {
        self.state
            .as_ref()
            .ok_or_else(|| anyhow!("failed to {op}, image '{}' does not exist", self.repo_name))
    }
}

async fn fetch_state(client: &Client, reference: &Reference) -> Result<RemoteState> {
    let (manifest, manifest_digest, config_text) = client
        .pull_manifest_and_config(reference, &RegistryAuth::Anonymous)
        .await
        .with_context(|| format!("fetching manifest for '{reference}'"))?;

    let config: ConfigFile = serde_json::from_str(&config_text)
        .with_context(|| format!("parsing config blob of '{reference}'"))?;

    let layers = manifest
        .layers
        .iter()
        .map(|descriptor| LayerSource::Fetched {
            origin: reference.clone(),
            descriptor: descriptor.clone(),
        })
        .collect();

    Ok(RemoteState {
        config,
        layers,
        manifest_digest,
    })
}

#[async_trait]
impl Image for RemoteImage {
    fn name(&self) -> &str {
        &self.repo_name
    }

    fn digest(&self) -> Result<String> {
        let state = self.state("get digest")?;
        Ok(state.manifest_digest.clone())
    }

    fn label(&self, key: &str) -> Result<String> {
        let state = self.state("get label")?;
        Ok(state.config.config.label(key))
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        let repo_name = self.repo_name.clone();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("failed to set label, image '{repo_name}' does not exist"))?;
        state.config.config.set_label(key, value);
        Ok(())
    }

    fn top_layer(&self) -> Result<String> {
        let state = self.state("get top layer")?;
        state
            .config
            .rootfs
            .diff_ids
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("image '{}' has no layers", self.repo_name))
    }

    async fn add_layer(&mut self, tar_path: &Path) -> Result<()> {
        let (descriptor, diff_id) = describe_blob(tar_path)
            .with_context(|| format!("add layer: {}", tar_path.display()))?;

        let repo_name = self.repo_name.clone();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("failed to add layer, image '{repo_name}' does not exist"))?;
        state.config.rootfs.diff_ids.push(diff_id);
        state.layers.push(LayerSource::Local {
            path: tar_path.to_path_buf(),
            descriptor,
        });
        state.manifest_digest = String::new();
        Ok(())
    }

    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> Result<()> {
        let state = self.state("rebase")?;
        let base_count = base_layer_count(&state.config.rootfs.diff_ids, base_top_layer)?;

        let base_reference: Reference = new_base
            .name()
            .parse()
            .with_context(|| format!("parsing image reference '{}'", new_base.name()))?;
        let base_state = fetch_state(&self.client, &base_reference)
            .await
            .context("rebase")?;

        let merged = merge_rebase_config(&state.config.config, &base_state.config.config);
        let diff_ids = splice_diff_ids(
            &state.config.rootfs.diff_ids,
            &base_state.config.rootfs.diff_ids,
            base_count,
        );

        let state = self.state.as_mut().expect("checked above");
        let mut layers = base_state.layers;
        layers.extend(state.layers.drain(..).skip(base_count));

        state.config = ConfigFile::new(merged, diff_ids);
        state.layers = layers;
        state.manifest_digest = String::new();
        Ok(())
    }

    async fn save(&mut self) -> Result<String> {
        let state = self.state("save")?;

        let mut image_layers = Vec::with_capacity(state.layers.len());
        let mut descriptors = Vec::with_capacity(state.layers.len());
        for layer in &state.layers {
            let data = match layer {
                LayerSource::Local { path, .. } => std::fs::read(path)
                    .with_context(|| format!("reading layer {}", path.display()))?,
                LayerSource::Fetched { origin, descriptor } => {
                    let mut data = Vec::new();
                    self.client
                        .pull_blob(origin, descriptor, &mut data)
                        .await
                        .with_context(|| format!("fetching layer {}", descriptor.digest))?;
                    data
                }
            };
            let descriptor = layer.descriptor().clone();
            image_layers.push(ImageLayer::new(
                data,
                descriptor.media_type.clone(),
                None,
            ));
            descriptors.push(descriptor);
        }

        let config_json =
            serde_json::to_vec(&state.config).context("encoding image config")?;
        let config_descriptor = OciDescriptor {
            media_type: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            digest: sha256_digest(&config_json),
            size: config_json.len() as i64,
            ..Default::default()
        };

        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_MEDIA_TYPE.to_string()),
            config: config_descriptor,
            layers: descriptors,
            ..Default::default()
        };
        let manifest_digest =
            sha256_digest(&serde_json::to_vec(&manifest).context("encoding manifest")?);

        let config = PushConfig::new(config_json, IMAGE_CONFIG_MEDIA_TYPE.to_string(), None);
        self.client
            .push(
                &self.reference,
                &image_layers,
                config,
                &RegistryAuth::Anonymous,
                Some(manifest),
            )
            .await
            .with_context(|| format!("pushing image '{}'", self.repo_name))?;

        debug!("Pushed {} ({})", self.repo_name, manifest_digest);

        let state = self.state.as_mut().expect("checked above");
        state.manifest_digest = manifest_digest.clone();
        Ok(manifest_digest)
    }
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Describe a layer blob: its registry descriptor (over the blob as
/// stored) and its diff-id (over the uncompressed stream).
fn describe_blob(path: &Path) -> Result<(OciDescriptor, String)> {
    let data = std::fs::read(path).with_context(|| format!("opening {}", path.display()))?;
    let gzip = data.starts_with(&[0x1f, 0x8b]);

    let diff_id = if gzip {
        let mut hasher = Sha256::new();
        std::io::copy(&mut GzDecoder::new(&data[..]), &mut hasher)?;
        format!("sha256:{}", hex::encode(hasher.finalize()))
    } else {
        sha256_digest(&data)
    };

    let media_type = if gzip {
        IMAGE_LAYER_GZIP_MEDIA_TYPE
    } else {
        IMAGE_LAYER_MEDIA_TYPE
    };
    let descriptor = OciDescriptor {
        media_type: media_type.to_string(),
        digest: sha256_digest(&data),
        size: data.len() as i64,
        ..Default::default()
    };
    Ok((descriptor, diff_id))
}
