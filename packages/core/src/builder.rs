//! Builder image assembly
//!
//! A builder image is the stack's build base plus one layer per
//! buildpack (rooted at `/buildpacks/<escaped-id>/<version>`) and a final
//! layer carrying `/buildpacks/order.toml`. The order layer goes last so
//! the detector always reads the order this builder was created with.

use crate::archive;
use crate::buildpack::{BuildpackGroup, BuildpackToml, Order, escape_id};
use crate::config::ConfigStore;
use crate::docker::{self, DockerClient};
use crate::image::{Image, ImageFactory};
use anyhow::{Context, Result, anyhow, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One `[[buildpacks]]` entry of a builder TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderBuildpack {
    pub id: String,
    pub uri: String,
}

/// A parsed builder TOML: the buildpacks to package and the detection
/// order to bake in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderToml {
    #[serde(default)]
    pub buildpacks: Vec<BuilderBuildpack>,
    #[serde(default)]
    pub groups: Vec<BuildpackGroup>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateBuilderFlags {
    pub repo_name: String,
    pub builder_toml_path: String,
    pub stack_id: String,
    pub publish: bool,
    pub no_pull: bool,
}

pub struct BuilderFactory {
    pub docker: DockerClient,
    pub config: ConfigStore,
    pub images: ImageFactory,
}

impl BuilderFactory {
    pub fn new(docker: DockerClient, config: ConfigStore) -> Self {
        let images = ImageFactory::new(docker.clone());
        Self {
            docker,
            config,
            images,
        }
    }

    /// The build base for a stack: its first build image.
    fn base_image_name(&self, stack_id: &str) -> Result<String> {
        let stack = self.config.get_stack(stack_id)?;
        stack.build_images.first().cloned().ok_or_else(|| {
            anyhow!(
                r#"Invalid stack: stack "{}" requires at least one build image"#,
                stack.id
            )
        })
    }

    pub async fn create(&self, flags: CreateBuilderFlags) -> Result<()> {
        let base_image = self.base_image_name(&flags.stack_id)?;
        let builder_toml = read_builder_toml(Path::new(&flags.builder_toml_path))?;

        let scratch = tempfile::tempdir().context("failed to create temporary directory")?;
        let mut layers = Vec::with_capacity(builder_toml.buildpacks.len() + 1);
        for buildpack in &builder_toml.buildpacks {
            let layer = buildpack_layer(scratch.path(), buildpack).with_context(|| {
                format!(r#"failed to generate layer for buildpack "{}""#, buildpack.id)
            })?;
            layers.push(layer);
        }
        layers.push(
            order_layer(scratch.path(), &builder_toml.groups)
                .context("failed to generate order.toml layer")?,
        );

        if flags.publish {
            let image = self.images.new_remote(&base_image).await?;
            if !image.found() {
                bail!(r#"base image "{base_image}" was not found"#);
            }
            let mut image = image.with_repo_name(&flags.repo_name)?;
            append_and_save(&mut image, &layers, &flags.repo_name).await
        } else {
            if !flags.no_pull {
                println!("Pulling builder base image {base_image}");
            }
            let image = self
                .images
                .new_local(&base_image, !flags.no_pull)
                .await
                .with_context(|| format!(r#"failed to pull stack build image "{base_image}""#))?;
            if !docker::image_exists(&self.docker, &base_image).await? {
                bail!(r#"base image "{base_image}" was not found"#);
            }
            let mut image = image.with_repo_name(&flags.repo_name);
            append_and_save(&mut image, &layers, &flags.repo_name).await
        }
    }
}

async fn append_and_save(
    image: &mut dyn Image,
    layers: &[PathBuf],
    repo_name: &str,
) -> Result<()> {
    for layer in layers {
        image
            .add_layer(layer)
            .await
            .context("failed to append layer to builder image")?;
    }
    let digest = image
        .save()
        .await
        .with_context(|| format!(r#"failed to write builder image "{repo_name}""#))?;
    debug!("Builder image {} saved ({})", repo_name, digest);
    println!("Successfully created builder image: {repo_name}");
    Ok(())
}

fn read_builder_toml(path: &Path) -> Result<BuilderToml> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        anyhow!(
            r#"failed to decode builder config from file "{}": {e}"#,
            path.display()
        )
    })?;
    toml::from_str(&text).map_err(|e| {
        anyhow!(
            r#"failed to decode builder config from file "{}": {e}"#,
            path.display()
        )
    })
}

/// Package one buildpack directory as a gzipped layer rooted at
/// `/buildpacks/<escaped-id>/<version>`, with a `latest` symlink beside
/// the version directory.
fn buildpack_layer(scratch: &Path, buildpack: &BuilderBuildpack) -> Result<PathBuf> {
    let dir = PathBuf::from(
        buildpack
            .uri
            .strip_prefix("file://")
            .unwrap_or(&buildpack.uri),
    );
    let toml = BuildpackToml::from_dir(&dir)?;

    if buildpack.id != toml.buildpack.id {
        bail!(
            "buildpack ids did not match: {} != {}",
            buildpack.id,
            toml.buildpack.id
        );
    }
    if toml.buildpack.version.is_empty() {
        bail!(
            "buildpack.toml must provide version: {}",
            dir.join("buildpack.toml").display()
        );
    }

    let escaped = escape_id(&buildpack.id);
    let version = &toml.buildpack.version;
    let layer_path = scratch.join(format!("{escaped}.{version}.tar.gz"));

    let file = File::create(&layer_path)
        .with_context(|| format!("creating layer file {}", layer_path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    archive::append_tree(
        &mut builder,
        &dir,
        &format!("/buildpacks/{escaped}/{version}"),
        0,
        0,
    )?;
    // `@latest` references resolve through this link at detect time.
    archive::add_symlink_to_tar(
        &mut builder,
        &format!("/buildpacks/{escaped}/latest"),
        version,
        0,
        0,
    )?;
    let encoder = builder.into_inner().context("finishing layer tar")?;
    encoder.finish().context("finishing layer gzip stream")?;

    Ok(layer_path)
}

/// The layer carrying `/buildpacks/order.toml`.
fn order_layer(scratch: &Path, groups: &[BuildpackGroup]) -> Result<PathBuf> {
    let order_dir = scratch.join("order");
    std::fs::create_dir_all(&order_dir)?;
    let order = Order {
        groups: groups.to_vec(),
    };
    std::fs::write(order_dir.join("order.toml"), order.encode()?)?;

    let layer_path = scratch.join("order.tar.gz");
    archive::create_tgz_file(&layer_path, &order_dir, "/buildpacks", 0, 0)?;
    Ok(layer_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildpack::BuildpackRef;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tar::Archive;

    fn buildpack_dir(id: &str, version: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("buildpack.toml"),
            format!("[buildpack]\nid = \"{id}\"\nversion = \"{version}\"\n"),
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/detect"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("bin/build"), "#!/bin/sh\n").unwrap();
        dir
    }

    fn tgz_entry_names(path: &Path) -> Vec<String> {
        let mut archive = Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn builder_toml_decodes_buildpacks_and_groups() {
        let parsed: BuilderToml = toml::from_str(
            r#"
[[buildpacks]]
id = "some/bp-one"
uri = "file:///tmp/bp-one"

[[groups]]
  [[groups.buildpacks]]
  id = "some/bp-one"
  version = "0.0.1"
  optional = false
"#,
        )
        .unwrap();
        assert_eq!(parsed.buildpacks.len(), 1);
        assert_eq!(parsed.buildpacks[0].uri, "file:///tmp/bp-one");
        assert_eq!(parsed.groups[0].buildpacks[0].id, "some/bp-one");
    }

    #[test]
    fn read_builder_toml_missing_file_names_it() {
        let err = read_builder_toml(Path::new("/no/such/builder.toml")).unwrap_err();
        assert!(
            err.to_string()
                .starts_with(r#"failed to decode builder config from file "/no/such/builder.toml""#)
        );
    }

    #[test]
    fn buildpack_layer_roots_entries_at_escaped_id_and_version() {
        let bp_dir = buildpack_dir("some/bp-one", "0.0.1");
        let scratch = tempfile::tempdir().unwrap();

        let layer = buildpack_layer(
            scratch.path(),
            &BuilderBuildpack {
                id: "some/bp-one".to_string(),
                uri: format!("file://{}", bp_dir.path().display()),
            },
        )
        .unwrap();

        let names = tgz_entry_names(&layer);
        assert!(names.contains(&"buildpacks/some_bp-one/0.0.1/buildpack.toml".to_string()));
        assert!(names.contains(&"buildpacks/some_bp-one/0.0.1/bin/detect".to_string()));
        assert!(names.contains(&"buildpacks/some_bp-one/latest".to_string()));
    }

    #[test]
    fn buildpack_layer_rejects_mismatched_ids() {
        let bp_dir = buildpack_dir("actual/id", "0.0.1");
        let scratch = tempfile::tempdir().unwrap();

        let err = buildpack_layer(
            scratch.path(),
            &BuilderBuildpack {
                id: "declared/id".to_string(),
                uri: format!("file://{}", bp_dir.path().display()),
            },
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "buildpack ids did not match: declared/id != actual/id"
        );
    }

    #[test]
    fn buildpack_layer_requires_version() {
        let bp_dir = buildpack_dir("some/bp", "");
        let scratch = tempfile::tempdir().unwrap();

        let err = buildpack_layer(
            scratch.path(),
            &BuilderBuildpack {
                id: "some/bp".to_string(),
                uri: format!("file://{}", bp_dir.path().display()),
            },
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("buildpack.toml must provide version:")
        );
    }

    #[test]
    fn buildpack_layer_missing_toml_names_the_file() {
        let empty = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();

        let err = buildpack_layer(
            scratch.path(),
            &BuilderBuildpack {
                id: "some/bp".to_string(),
                uri: format!("file://{}", empty.path().display()),
            },
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("reading buildpack.toml from buildpack")
        );
    }

    #[test]
    fn order_layer_roundtrips_groups() {
        let scratch = tempfile::tempdir().unwrap();
        let groups = vec![BuildpackGroup {
            buildpacks: vec![BuildpackRef {
                id: "some/bp-one".to_string(),
                version: "0.0.1".to_string(),
                optional: false,
            }],
        }];

        let layer = order_layer(scratch.path(), &groups).unwrap();

        let mut archive = Archive::new(GzDecoder::new(File::open(&layer).unwrap()));
        let mut order_text = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().ends_with("order.toml") {
                let mut text = String::new();
                entry.read_to_string(&mut text).unwrap();
                order_text = Some(text);
            }
        }

        let decoded = Order::parse(&order_text.expect("order.toml present")).unwrap();
        assert_eq!(decoded.groups, groups);
    }
}
