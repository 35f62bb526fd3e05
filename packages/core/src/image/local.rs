//! Daemon-backed image handle
//!
//! The handle keeps an inspect snapshot plus a parallel `layer_paths`
//! list: one slot per root-fs diff-id, holding the tar blob that will be
//! written on save, or `None` for a layer that already lives in the
//! daemon. `save` streams a load archive (config blob, layer tars,
//! `manifest.json`) into the image-load endpoint; layers without a local
//! blob are materialized from the daemon's export stream first. Rebase
//! assembles its result under a temporary tag which `save` then points
//! the real repository at.

use super::Image;
use super::oci::{
    ConfigFile, RuntimeConfig, SaveManifestEntry, base_layer_count, merge_rebase_config,
    runtime_config_from_inspect, splice_diff_ids,
};
use crate::archive::{add_file_to_tar, add_text_to_tar};
use crate::docker::{self, DockerClient};
use crate::reference::ImageRef;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bollard::body_full;
use bollard::query_parameters::{ImportImageOptions, TagImageOptions};
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// State captured from the daemon when the handle was opened.
#[derive(Debug, Clone, Default)]
struct InspectState {
    config: RuntimeConfig,
    diff_ids: Vec<String>,
    repo_digests: Vec<String>,
}

pub struct LocalImage {
    docker: DockerClient,
    /// Reference `save` writes to.
    repo_name: String,
    /// Reference whose daemon blobs back the `None` layer slots.
    source_name: String,
    inspect: Option<InspectState>,
    layer_paths: Vec<Option<PathBuf>>,
    current_temp_image: Option<String>,
    /// Keeps exported blobs alive until the handle is dropped.
    scratch: Option<tempfile::TempDir>,
}

impl LocalImage {
    pub(super) async fn open(docker: DockerClient, repo_name: &str, pull: bool) -> Result<Self> {
        if pull {
            docker::pull_image(&docker, repo_name)
                .await
                .map_err(|e| anyhow!("failed to pull image '{repo_name}' : {e}"))?;
        }

        let inspect = docker::inspect_image(&docker, repo_name)
            .await
            .with_context(|| format!("inspecting image '{repo_name}'"))?;

        let state = inspect.map(|inspect| InspectState {
            config: inspect
                .config
                .as_ref()
                .map(runtime_config_from_inspect)
                .unwrap_or_default(),
            diff_ids: docker::image::rootfs_layers(&inspect),
            repo_digests: inspect.repo_digests.unwrap_or_default(),
        });
        let layer_count = state.as_ref().map(|s| s.diff_ids.len()).unwrap_or(0);

        Ok(Self {
            docker,
            repo_name: repo_name.to_string(),
            source_name: repo_name.to_string(),
            inspect: state,
            layer_paths: vec![None; layer_count],
            current_temp_image: None,
            scratch: None,
        })
    }

    /// Retarget where `save` writes, keeping the inspected base state.
    pub fn with_repo_name(mut self, repo_name: &str) -> Self {
        self.repo_name = repo_name.to_string();
        self
    }

    fn state(&self, op: &str) -> Result<&InspectState> {
        self.inspect
            .as_ref()
            .ok_or_else(|| anyhow!("failed to {op}, image '{}' does not exist", self.repo_name))
    }

    fn scratch_dir(&mut self) -> Result<PathBuf> {
        if self.scratch.is_none() {
            self.scratch = Some(tempfile::tempdir().context("creating scratch directory")?);
        }
        Ok(self.scratch.as_ref().unwrap().path().to_path_buf())
    }

    /// Fill every empty layer slot with a blob exported from the daemon.
    async fn materialize_layers(&mut self) -> Result<()> {
        if self.layer_paths.iter().all(Option::is_some) {
            return Ok(());
        }
        let scratch = self.scratch_dir()?;
        let dest = scratch.join("source");
        std::fs::create_dir_all(&dest)?;
        let blobs = export_layer_blobs(&self.docker, &self.source_name, &dest).await?;

        for (index, slot) in self.layer_paths.iter_mut().enumerate() {
            if slot.is_none() {
                let blob = blobs.get(index).ok_or_else(|| {
                    anyhow!(
                        "image '{}' export is missing layer {index}",
                        self.source_name
                    )
                })?;
                *slot = Some(blob.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Image for LocalImage {
    fn name(&self) -> &str {
        &self.repo_name
    }

    fn digest(&self) -> Result<String> {
        let state = self.state("get digest")?;
        let Some(first) = state.repo_digests.first() else {
            return Ok(String::new());
        };
        match first.split_once('@') {
            Some((_, digest)) => Ok(digest.to_string()),
            None => bail!(
                "failed to get digest, image '{}' has malformed digest '{first}'",
                self.repo_name
            ),
        }
    }

    fn label(&self, key: &str) -> Result<String> {
        let state = self.state("get label")?;
        Ok(state.config.label(key))
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        let repo_name = self.repo_name.clone();
        let state = self
            .inspect
            .as_mut()
            .ok_or_else(|| anyhow!("failed to set label, image '{repo_name}' does not exist"))?;
        state.config.set_label(key, value);
        Ok(())
    }

    fn top_layer(&self) -> Result<String> {
        let state = self.state("get top layer")?;
        state
            .diff_ids
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("image '{}' has no layers", self.repo_name))
    }

    async fn add_layer(&mut self, tar_path: &Path) -> Result<()> {
        let diff_id = layer_diff_id(tar_path)
            .with_context(|| format!("add layer: {}", tar_path.display()))?;

        let repo_name = self.repo_name.clone();
        let state = self
            .inspect
            .as_mut()
            .ok_or_else(|| anyhow!("failed to add layer, image '{repo_name}' does not exist"))?;
        state.diff_ids.push(diff_id);
        self.layer_paths.push(Some(tar_path.to_path_buf()));
        Ok(())
    }

    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> Result<()> {
        let state = self.state("rebase")?.clone();
        let base_count = base_layer_count(&state.diff_ids, base_top_layer)?;

        let base_inspect = docker::inspect_image(&self.docker, new_base.name())
            .await
            .context("rebase")?
            .ok_or_else(|| anyhow!("rebase: image '{}' does not exist", new_base.name()))?;
        let base_config = base_inspect
            .config
            .as_ref()
            .map(runtime_config_from_inspect)
            .unwrap_or_default();
        let base_diff_ids = docker::image::rootfs_layers(&base_inspect);

        let merged = merge_rebase_config(&state.config, &base_config);
        let diff_ids = splice_diff_ids(&state.diff_ids, &base_diff_ids, base_count);

        // Collect the blobs of both images, then stitch the archive:
        // base prefix from the new base, app suffix from the target.
        let scratch = self.scratch_dir()?;
        let target_dir = scratch.join("rebase-target");
        let base_dir = scratch.join("rebase-base");
        std::fs::create_dir_all(&target_dir)?;
        std::fs::create_dir_all(&base_dir)?;
        let target_blobs =
            export_layer_blobs(&self.docker, &self.source_name, &target_dir).await?;
        let base_blobs = export_layer_blobs(&self.docker, new_base.name(), &base_dir).await?;

        let mut layers: Vec<PathBuf> = base_blobs;
        if layers.len() != base_diff_ids.len() {
            bail!("rebase: image '{}' export is incomplete", new_base.name());
        }
        layers.extend(target_blobs.into_iter().skip(base_count));

        let temp_name = temp_image_name();
        let config_file = ConfigFile::new(merged.clone(), diff_ids.clone());
        let archive = assemble_image_archive(&config_file, &normalized_tag(&temp_name), &layers)?;
        load_archive(&self.docker, archive).await.context("rebase")?;

        debug!("Rebased {} onto {} as {}", self.repo_name, new_base.name(), temp_name);

        self.inspect = Some(InspectState {
            config: merged,
            diff_ids,
            repo_digests: Vec::new(),
        });
        self.layer_paths = vec![None; self.inspect.as_ref().unwrap().diff_ids.len()];
        self.source_name = temp_name.clone();
        self.current_temp_image = Some(temp_name);
        Ok(())
    }

    async fn save(&mut self) -> Result<String> {
        let state = self.state("save")?.clone();

        if let Some(temp) = self.current_temp_image.clone() {
            // The rebase result is already loaded; point the repository
            // at it.
            let (repo, tag) = split_repo_tag(&self.repo_name);
            let options = TagImageOptions {
                repo: Some(repo),
                tag: Some(tag),
            };
            self.docker
                .inner()
                .tag_image(&temp, Some(options))
                .await
                .with_context(|| format!("tagging {temp} as {}", self.repo_name))?;

            let inspect = docker::inspect_image(&self.docker, &temp)
                .await?
                .ok_or_else(|| anyhow!("saved image '{temp}' disappeared"))?;
            return Ok(inspect.id.unwrap_or_default());
        }

        self.materialize_layers().await?;
        let layers: Vec<PathBuf> = self
            .layer_paths
            .iter()
            .map(|slot| slot.clone().expect("layer slots are materialized"))
            .collect();

        let config_file = ConfigFile::new(state.config.clone(), state.diff_ids.clone());
        let config_json = serde_json::to_vec(&config_file).context("encoding image config")?;
        let image_id = hex::encode(Sha256::digest(&config_json));

        let archive = assemble_image_archive(&config_file, &normalized_tag(&self.repo_name), &layers)?;
        load_archive(&self.docker, archive)
            .await
            .with_context(|| format!("saving image '{}'", self.repo_name))?;
        Ok(image_id)
    }
}

/// Split a reference into its repository and tag, defaulting `latest`.
fn split_repo_tag(reference: &str) -> (String, String) {
    let rest = reference.split('@').next().unwrap_or(reference);
    match rest.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (rest.to_string(), "latest".to_string()),
    }
}

/// Reference with an explicit tag, as required by load manifests.
fn normalized_tag(repo_name: &str) -> String {
    let parsed = ImageRef::parse(repo_name);
    if parsed.tag.is_some() || parsed.digest.is_some() {
        repo_name.to_string()
    } else {
        format!("{repo_name}:latest")
    }
}

fn temp_image_name() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..8).map(|_| rng.random_range('a'..='z')).collect();
    format!("pack-rebase-tmp-{suffix}")
}

/// The sha256 of a layer's uncompressed tar stream.
fn layer_diff_id(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    if blob_is_gzip(path)? {
        std::io::copy(&mut GzDecoder::new(&mut file), &mut hasher)?;
    } else {
        std::io::copy(&mut file, &mut hasher)?;
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn blob_is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

/// Build the image-load archive: config blob, one uncompressed tar per
/// layer, and a manifest naming them in root-fs order.
fn assemble_image_archive(
    config: &ConfigFile,
    repo_tag: &str,
    layers: &[PathBuf],
) -> Result<Vec<u8>> {
    let config_json = serde_json::to_vec(config).context("encoding image config")?;
    let image_id = hex::encode(Sha256::digest(&config_json));

    let mut builder = tar::Builder::new(Vec::new());
    add_text_to_tar(&mut builder, &format!("{image_id}.json"), &config_json)?;

    let mut layer_names = Vec::with_capacity(layers.len());
    for path in layers {
        let name = format!(
            "{}.tar",
            hex::encode(Sha256::digest(path.display().to_string().as_bytes()))
        );
        if blob_is_gzip(path)? {
            // The load endpoint wants the uncompressed stream that the
            // diff-id was computed over.
            let mut decoder = GzDecoder::new(File::open(path)?);
            let mut data = Vec::new();
            decoder.read_to_end(&mut data)?;
            add_text_to_tar(&mut builder, &name, &data)?;
        } else {
            let size = std::fs::metadata(path)?.len();
            add_file_to_tar(&mut builder, &name, size, File::open(path)?)?;
        }
        layer_names.push(name);
    }

    let manifest = vec![SaveManifestEntry {
        config: format!("{image_id}.json"),
        repo_tags: vec![repo_tag.to_string()],
        layers: layer_names,
    }];
    let manifest_json = serde_json::to_vec(&manifest).context("encoding manifest.json")?;
    add_text_to_tar(&mut builder, "manifest.json", &manifest_json)?;

    builder.into_inner().context("finishing image archive")
}

async fn load_archive(docker: &DockerClient, archive: Vec<u8>) -> Result<()> {
    let mut stream = docker.inner().import_image(
        ImportImageOptions::default(),
        body_full(archive.into()),
        None,
    );
    while let Some(result) = stream.next().await {
        let info = result.context("loading image archive")?;
        if let Some(error) = info.error {
            bail!("loading image archive: {error}");
        }
    }
    Ok(())
}

/// Export an image through the daemon's save endpoint and return its
/// layer blob paths in root-fs order.
async fn export_layer_blobs(
    docker: &DockerClient,
    reference: &str,
    dest: &Path,
) -> Result<Vec<PathBuf>> {
    debug!("Exporting layers of {}", reference);

    let archive_path = dest.join("export.tar");
    let mut file = tokio::fs::File::create(&archive_path)
        .await
        .with_context(|| format!("creating {}", archive_path.display()))?;
    let mut stream = docker.inner().export_image(reference);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("exporting image '{reference}'"))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    let unpacked = dest.join("unpacked");
    std::fs::create_dir_all(&unpacked)?;
    let mut archive = tar::Archive::new(File::open(&archive_path)?);
    archive
        .unpack(&unpacked)
        .with_context(|| format!("unpacking export of '{reference}'"))?;

    let manifest_json = std::fs::read(unpacked.join("manifest.json"))
        .with_context(|| format!("export of '{reference}' has no manifest.json"))?;
    let manifest: Vec<SaveManifestEntry> =
        serde_json::from_slice(&manifest_json).context("parsing export manifest.json")?;
    let entry = manifest
        .first()
        .ok_or_else(|| anyhow!("export of '{reference}' has an empty manifest"))?;

    Ok(entry
        .layers
        .iter()
        .map(|layer| unpacked.join(layer))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::create_single_file_tar;
    use std::collections::HashMap;
    use std::io::Write;

    fn handle_with(diff_ids: &[&str], labels: HashMap<String, String>) -> LocalImage {
        LocalImage {
            docker: DockerClient::new().unwrap(),
            repo_name: "some/app".to_string(),
            source_name: "some/app".to_string(),
            inspect: Some(InspectState {
                config: RuntimeConfig {
                    labels: Some(labels),
                    ..Default::default()
                },
                diff_ids: diff_ids.iter().map(|s| s.to_string()).collect(),
                repo_digests: vec!["some/app@sha256:feedface".to_string()],
            }),
            layer_paths: vec![None; diff_ids.len()],
            current_temp_image: None,
            scratch: None,
        }
    }

    fn missing_handle() -> LocalImage {
        LocalImage {
            docker: DockerClient::new().unwrap(),
            repo_name: "missing/app".to_string(),
            source_name: "missing/app".to_string(),
            inspect: None,
            layer_paths: Vec::new(),
            current_temp_image: None,
            scratch: None,
        }
    }

    #[test]
    fn label_returns_value_or_empty() {
        let handle = handle_with(
            &["sha256:a"],
            HashMap::from([("mykey".to_string(), "myvalue".to_string())]),
        );
        assert_eq!(handle.label("mykey").unwrap(), "myvalue");
        assert_eq!(handle.label("missing-label").unwrap(), "");
    }

    #[test]
    fn label_on_missing_image_errors() {
        let handle = missing_handle();
        let err = handle.label("mykey").unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to get label, image 'missing/app' does not exist"
        );
    }

    #[test]
    fn set_label_is_visible_before_save() {
        let mut handle = handle_with(&["sha256:a"], HashMap::new());
        handle.set_label("mykey", "new-val").unwrap();
        assert_eq!(handle.label("mykey").unwrap(), "new-val");
    }

    #[test]
    fn top_layer_is_last_rootfs_entry() {
        let handle = handle_with(&["sha256:a", "sha256:b", "sha256:c"], HashMap::new());
        assert_eq!(handle.top_layer().unwrap(), "sha256:c");
    }

    #[test]
    fn digest_comes_from_repo_digests() {
        let handle = handle_with(&["sha256:a"], HashMap::new());
        assert_eq!(handle.digest().unwrap(), "sha256:feedface");
    }

    #[tokio::test]
    async fn add_layer_keeps_paths_parallel_to_diff_ids() {
        let dir = tempfile::tempdir().unwrap();
        let tar = create_single_file_tar("/new-layer.txt", "new-layer").unwrap();
        let tar_path = dir.path().join("layer.tar");
        std::fs::write(&tar_path, &tar).unwrap();

        let mut handle = handle_with(&["sha256:a", "sha256:b"], HashMap::new());
        handle.add_layer(&tar_path).await.unwrap();

        let state = handle.inspect.as_ref().unwrap();
        assert_eq!(state.diff_ids.len(), 3);
        assert_eq!(handle.layer_paths.len(), state.diff_ids.len());
        assert!(state.diff_ids[2].starts_with("sha256:"));
        assert_eq!(handle.top_layer().unwrap(), state.diff_ids[2]);
    }

    #[tokio::test]
    async fn add_layer_hashes_through_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let tar = create_single_file_tar("/file.txt", "content").unwrap();

        let plain_path = dir.path().join("layer.tar");
        std::fs::write(&plain_path, &tar).unwrap();

        let gz_path = dir.path().join("layer.tar.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            File::create(&gz_path).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap();

        // The diff-id is over the uncompressed stream either way.
        assert_eq!(
            layer_diff_id(&plain_path).unwrap(),
            layer_diff_id(&gz_path).unwrap()
        );
    }

    #[test]
    fn assemble_archive_contains_config_layers_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let tar = create_single_file_tar("/file.txt", "content").unwrap();
        let layer_path = dir.path().join("layer.tar");
        std::fs::write(&layer_path, &tar).unwrap();

        let config = ConfigFile::new(RuntimeConfig::default(), vec!["sha256:a".to_string()]);
        let archive =
            assemble_image_archive(&config, "some/app:latest", &[layer_path.clone()]).unwrap();

        let mut names = Vec::new();
        let mut manifest_text = String::new();
        let mut reader = tar::Archive::new(&archive[..]);
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            if name == "manifest.json" {
                entry.read_to_string(&mut manifest_text).unwrap();
            }
            names.push(name);
        }

        assert_eq!(names.len(), 3);
        assert!(names.iter().any(|n| n.ends_with(".json")));
        assert!(names.iter().any(|n| n.ends_with(".tar")));

        let manifest: Vec<SaveManifestEntry> = serde_json::from_str(&manifest_text).unwrap();
        assert_eq!(manifest[0].repo_tags, vec!["some/app:latest"]);
        assert_eq!(manifest[0].layers.len(), 1);
        assert_eq!(manifest[0].config, format!("{}.json", {
            let config_json = serde_json::to_vec(&config).unwrap();
            hex::encode(Sha256::digest(&config_json))
        }));
    }

    #[test]
    fn normalized_tag_appends_latest() {
        assert_eq!(normalized_tag("some/app"), "some/app:latest");
        assert_eq!(normalized_tag("some/app:v1"), "some/app:v1");
        assert_eq!(normalized_tag("registry.com:5000/app"), "registry.com:5000/app:latest");
    }

    #[test]
    fn split_repo_tag_defaults_latest() {
        assert_eq!(
            split_repo_tag("some/app"),
            ("some/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_repo_tag("registry.com:5000/some/app:v2"),
            ("registry.com:5000/some/app".to_string(), "v2".to_string())
        );
    }

    #[test]
    fn temp_image_names_are_random() {
        let first = temp_image_name();
        let second = temp_image_name();
        assert!(first.starts_with("pack-rebase-tmp-"));
        assert_ne!(first, second);
    }
}
