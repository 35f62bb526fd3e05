//! Build pipeline orchestration
//!
//! Drives the four lifecycle phases (Detect, Analyze, Build, Export),
//! each inside an ephemeral container created from the builder image.
//! The phases communicate only through the cache volume mounted as
//! `/workspace`; the orchestrator copies inputs in through the container
//! copy endpoint, keeps workspace ownership aligned with the builder's
//! pack user, and asserts on exit codes. Nothing in here runs buildpack
//! logic itself.

use crate::archive;
use crate::buildpack::{BuildpackGroup, BuildpackRef, BuildpackToml, Order, escape_id};
use crate::config::{ConfigStore, image_by_registry};
use crate::docker::{self, ContainerSpec, DockerClient};
use crate::image::{Image, ImageFactory};
use crate::reference::registry_of;
use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const WORKSPACE_DIR: &str = "/workspace";
pub const BUILDPACKS_DIR: &str = "/buildpacks";
pub const PLATFORM_DIR: &str = "/platform";
pub const ORDER_PATH: &str = "/buildpacks/order.toml";
pub const GROUP_PATH: &str = "/workspace/group.toml";
pub const PLAN_PATH: &str = "/workspace/plan.toml";

/// Label coupling builder and run images to a stack.
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";

/// Sentinel flag value meaning "use the current working directory".
pub const CWD_PLACEHOLDER: &str = "current working directory";

const DOCKER_SOCKET_BIND: &str = "/var/run/docker.sock:/var/run/docker.sock";

/// Raw user input for a build.
#[derive(Debug, Clone, Default)]
pub struct BuildFlags {
    pub app_dir: String,
    pub builder: String,
    pub run_image: String,
    pub env_file: String,
    pub repo_name: String,
    pub publish: bool,
    pub no_pull: bool,
    pub clear_cache: bool,
    pub buildpacks: Vec<String>,
}

/// Shared dependencies for resolving and running builds.
pub struct BuildFactory {
    pub docker: DockerClient,
    pub config: ConfigStore,
    pub images: ImageFactory,
}

impl BuildFactory {
    pub fn new(docker: DockerClient, config: ConfigStore) -> Self {
        let images = ImageFactory::new(docker.clone());
        Self {
            docker,
            config,
            images,
        }
    }

    /// Resolve flags into a runnable build: defaults applied, builder and
    /// run image validated against each other's stack, cache volume
    /// derived.
    pub async fn build_config(&self, flags: BuildFlags) -> Result<BuildConfig> {
        let app_dir = resolve_app_dir(&flags.app_dir)?;

        let repo_name = if flags.repo_name.is_empty() {
            default_repo_name(&app_dir)
        } else {
            flags.repo_name.clone()
        };

        let env_file = if flags.env_file.is_empty() {
            BTreeMap::new()
        } else {
            parse_env_file(Path::new(&flags.env_file))?
        };

        let builder = if flags.builder.is_empty() {
            self.config
                .config
                .default_builder
                .clone()
                .ok_or_else(|| {
                    anyhow!("no builder provided. Run 'pack set-default-builder <image>' or use --builder")
                })?
        } else {
            flags.builder.clone()
        };

        let builder_image = self
            .images
            .new_local(&builder, !flags.no_pull && !flags.publish)
            .await
            .with_context(|| format!("reading builder image \"{builder}\""))?;
        let builder_stack = stack_id_of(&builder_image, "builder")?;
        let stack = self.config.get_stack(&builder_stack)?;

        let run_image = if flags.run_image.is_empty() {
            let selected = image_by_registry(&registry_of(&repo_name), &stack.run_images)?;
            debug!("Selected run image {} from stack {}", selected, builder_stack);
            selected
        } else {
            flags.run_image.clone()
        };

        let run_stack = if flags.publish {
            let image = self.images.new_remote(&run_image).await?;
            stack_id_of(&image, "run")?
        } else {
            let image = self
                .images
                .new_local(&run_image, !flags.no_pull)
                .await
                .with_context(|| format!("reading run image \"{run_image}\""))?;
            stack_id_of(&image, "run")?
        };
        if run_stack != builder_stack {
            return Err(stack_mismatch_error(
                &run_stack,
                &run_image,
                &builder_stack,
                &builder,
            ));
        }

        let cache_volume = docker::cache_volume_name(&repo_name);
        debug!("Using cache volume {}", cache_volume);

        Ok(BuildConfig {
            app_dir,
            builder,
            run_image,
            env_file,
            repo_name,
            publish: flags.publish,
            no_pull: flags.no_pull,
            clear_cache: flags.clear_cache,
            buildpacks: flags.buildpacks,
            cache_volume,
            docker: self.docker.clone(),
            images: self.images.clone(),
        })
    }
}

/// A fully resolved build, ready to run.
pub struct BuildConfig {
    pub app_dir: PathBuf,
    pub builder: String,
    pub run_image: String,
    pub env_file: BTreeMap<String, String>,
    pub repo_name: String,
    pub publish: bool,
    pub no_pull: bool,
    pub clear_cache: bool,
    pub buildpacks: Vec<String>,
    pub cache_volume: String,
    pub docker: DockerClient,
    pub images: ImageFactory,
}

impl BuildConfig {
    /// Run the full pipeline. Any phase failure aborts; the cache volume
    /// is left in place for post-mortems and cache reuse on retry.
    pub async fn run(&self) -> Result<()> {
        println!("===> DETECTING");
        self.detect().await?;

        println!("===> ANALYZING");
        self.analyze().await?;

        println!("===> BUILDING");
        self.build().await?;

        println!("===> EXPORTING");
        self.export().await?;

        Ok(())
    }

    fn workspace_bind(&self) -> Vec<String> {
        vec![format!("{}:{}", self.cache_volume, WORKSPACE_DIR)]
    }

    pub async fn detect(&self) -> Result<()> {
        if self.clear_cache {
            docker::remove_volume(&self.docker, &self.cache_volume, true)
                .await
                .context("clearing cache")?;
            println!("Cache volume {} cleared", self.cache_volume);
        }
        docker::ensure_volume(&self.docker, &self.cache_volume).await?;

        let spec = ContainerSpec {
            image: self.builder.clone(),
            cmd: vec![
                "/lifecycle/detector".to_string(),
                "-buildpacks".to_string(),
                BUILDPACKS_DIR.to_string(),
                "-order".to_string(),
                ORDER_PATH.to_string(),
                "-group".to_string(),
                GROUP_PATH.to_string(),
                "-plan".to_string(),
                PLAN_PATH.to_string(),
            ],
            binds: self.workspace_bind(),
            ..Default::default()
        };
        let ctr = docker::create_container(&self.docker, spec)
            .await
            .context("container create")?;
        let result = self.detect_in(&ctr).await;
        let _ = docker::remove_container(&self.docker, &ctr, true).await;
        result
    }

    async fn detect_in(&self, ctr: &str) -> Result<()> {
        let order_toml = if self.buildpacks.is_empty() {
            // The order.toml baked into the builder image stands.
            String::new()
        } else {
            println!("Using manually-provided group");
            let buildpacks = self
                .copy_buildpacks_to_container(ctr)
                .await
                .context("copy buildpacks to container")?;
            let order = Order {
                groups: vec![BuildpackGroup { buildpacks }],
            };
            order.encode()?
        };

        let app_tar = archive::create_tar(
            &self.app_dir,
            &format!("{WORKSPACE_DIR}/app"),
            0,
            0,
        )
        .context("copy app to workspace volume")?;
        docker::copy_to_container(&self.docker, ctr, app_tar)
            .await
            .context("copy app to workspace volume")?;

        let (uid, gid) = self.pack_uid_gid().await.context("get pack uid gid")?;
        self.chown_dir(&format!("{WORKSPACE_DIR}/app"), uid, gid)
            .await
            .context("chown app to workspace volume")?;

        if !order_toml.is_empty() {
            let order_tar = archive::create_single_file_tar(ORDER_PATH, &order_toml)
                .context("converting order TOML to tar")?;
            docker::copy_to_container(&self.docker, ctr, order_tar)
                .await
                .with_context(|| format!("creating {ORDER_PATH}"))?;
        }

        self.copy_envs_to_container(ctr).await?;

        docker::run_container(&self.docker, ctr, "detector")
            .await
            .context("run detect container")?;
        Ok(())
    }

    pub async fn analyze(&self) -> Result<()> {
        // A missing previous image is the one tolerated failure: there is
        // simply nothing to reuse.
        if self.publish {
            let previous = self.images.new_remote(&self.repo_name).await?;
            if !previous.found() {
                println!(
                    "WARNING: skipping analyze, image not found or requires authentication to access"
                );
                return Ok(());
            }
        } else if !docker::image_exists(&self.docker, &self.repo_name).await? {
            println!("WARNING: skipping analyze, image not found");
            return Ok(());
        }

        let mut spec = ContainerSpec {
            image: self.builder.clone(),
            binds: self.workspace_bind(),
            ..Default::default()
        };
        if self.publish {
            spec.env = vec![format!("PACK_REGISTRY_AUTH={}", registry_auth_header())];
            spec.cmd = vec![
                "/lifecycle/analyzer".to_string(),
                "-layers".to_string(),
                WORKSPACE_DIR.to_string(),
                "-group".to_string(),
                GROUP_PATH.to_string(),
                self.repo_name.clone(),
            ];
            spec.network_mode = Some("host".to_string());
        } else {
            spec.cmd = vec![
                "/lifecycle/analyzer".to_string(),
                "-layers".to_string(),
                WORKSPACE_DIR.to_string(),
                "-group".to_string(),
                GROUP_PATH.to_string(),
                "-daemon".to_string(),
                self.repo_name.clone(),
            ];
            spec.user = Some("root".to_string());
            spec.binds.push(DOCKER_SOCKET_BIND.to_string());
        }

        let ctr = docker::create_container(&self.docker, spec)
            .await
            .context("analyze container create")?;
        let result = docker::run_container(&self.docker, &ctr, "analyzer")
            .await
            .context("run analyze container");
        let _ = docker::remove_container(&self.docker, &ctr, true).await;
        result?;

        let (uid, gid) = self.pack_uid_gid().await.context("get pack uid and gid")?;
        self.chown_dir(WORKSPACE_DIR, uid, gid)
            .await
            .context("chown launch dir")?;
        Ok(())
    }

    pub async fn build(&self) -> Result<()> {
        let spec = ContainerSpec {
            image: self.builder.clone(),
            cmd: vec![
                "/lifecycle/builder".to_string(),
                "-buildpacks".to_string(),
                BUILDPACKS_DIR.to_string(),
                "-layers".to_string(),
                WORKSPACE_DIR.to_string(),
                "-group".to_string(),
                GROUP_PATH.to_string(),
                "-plan".to_string(),
                PLAN_PATH.to_string(),
                "-platform".to_string(),
                PLATFORM_DIR.to_string(),
            ],
            binds: self.workspace_bind(),
            ..Default::default()
        };
        let ctr = docker::create_container(&self.docker, spec)
            .await
            .context("build container create")?;
        let result = self.build_in(&ctr).await;
        let _ = docker::remove_container(&self.docker, &ctr, true).await;
        result
    }

    async fn build_in(&self, ctr: &str) -> Result<()> {
        if !self.buildpacks.is_empty() {
            // Build runs in a fresh container; inline buildpacks must be
            // uploaded again.
            self.copy_buildpacks_to_container(ctr)
                .await
                .context("copy buildpacks to container")?;
        }
        self.copy_envs_to_container(ctr).await?;
        docker::run_container(&self.docker, ctr, "builder")
            .await
            .context("run build container")?;
        Ok(())
    }

    pub async fn export(&self) -> Result<()> {
        let mut spec = ContainerSpec {
            image: self.builder.clone(),
            binds: self.workspace_bind(),
            ..Default::default()
        };
        if self.publish {
            spec.env = vec![format!("PACK_REGISTRY_AUTH={}", registry_auth_header())];
            spec.cmd = vec![
                "/lifecycle/exporter".to_string(),
                "-image".to_string(),
                self.run_image.clone(),
                "-layers".to_string(),
                WORKSPACE_DIR.to_string(),
                "-group".to_string(),
                GROUP_PATH.to_string(),
                self.repo_name.clone(),
            ];
            spec.network_mode = Some("host".to_string());
        } else {
            spec.cmd = vec![
                "/lifecycle/exporter".to_string(),
                "-image".to_string(),
                self.run_image.clone(),
                "-layers".to_string(),
                WORKSPACE_DIR.to_string(),
                "-group".to_string(),
                GROUP_PATH.to_string(),
                "-daemon".to_string(),
                self.repo_name.clone(),
            ];
            spec.user = Some("root".to_string());
            spec.binds.push(DOCKER_SOCKET_BIND.to_string());
        }

        let ctr = docker::create_container(&self.docker, spec)
            .await
            .context("create export container")?;
        let result = self.export_in(&ctr).await;
        let _ = docker::remove_container(&self.docker, &ctr, true).await;
        result
    }

    async fn export_in(&self, ctr: &str) -> Result<()> {
        let (uid, gid) = self.pack_uid_gid().await.context("export")?;
        self.chown_dir(WORKSPACE_DIR, uid, gid)
            .await
            .context("chown launch dir")?;
        docker::run_container(&self.docker, ctr, "exporter")
            .await
            .context("run export container")?;
        Ok(())
    }

    /// Upload `--buildpack` directories and collect the group the
    /// detector should use instead of the builder's own order.
    async fn copy_buildpacks_to_container(&self, ctr: &str) -> Result<Vec<BuildpackRef>> {
        let mut refs = Vec::with_capacity(self.buildpacks.len());
        for buildpack in &self.buildpacks {
            let dir = Path::new(buildpack);
            if dir.join("buildpack.toml").is_file() {
                let toml = BuildpackToml::from_dir(dir)?;
                let target = format!(
                    "{BUILDPACKS_DIR}/{}/{}",
                    escape_id(&toml.buildpack.id),
                    toml.buildpack.version
                );
                let tar = archive::create_tar(dir, &target, 0, 0)
                    .with_context(|| format!("copying buildpack '{buildpack}' to container"))?;
                docker::copy_to_container(&self.docker, ctr, tar)
                    .await
                    .with_context(|| format!("copying buildpack '{buildpack}' to container"))?;
                refs.push(BuildpackRef {
                    id: toml.buildpack.id,
                    version: toml.buildpack.version,
                    optional: false,
                });
            } else {
                let (id, version) = parse_buildpack_ref(buildpack);
                if version == "latest" && !buildpack.contains('@') {
                    println!(
                        "No version for '{id}' buildpack provided, will use '{id}@latest'"
                    );
                }
                refs.push(BuildpackRef {
                    id,
                    version,
                    optional: false,
                });
            }
        }
        Ok(refs)
    }

    async fn copy_envs_to_container(&self, ctr: &str) -> Result<()> {
        if self.env_file.is_empty() {
            return Ok(());
        }
        let tar = tar_env_file(&self.env_file).context("create env files")?;
        docker::copy_to_container(&self.docker, ctr, tar)
            .await
            .context("create env files")?;
        Ok(())
    }

    /// The pack uid/gid declared by the builder image's environment.
    pub async fn pack_uid_gid(&self) -> Result<(u32, u32)> {
        let inspect = docker::inspect_image(&self.docker, &self.builder)
            .await
            .context("reading builder env variables")?
            .ok_or_else(|| anyhow!("builder image '{}' does not exist", self.builder))?;
        parse_pack_uid_gid(&docker::image::config_env(&inspect))
    }

    /// Recursively chown a workspace path inside a root helper container.
    async fn chown_dir(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let spec = ContainerSpec {
            image: self.builder.clone(),
            cmd: vec![
                "chown".to_string(),
                "-R".to_string(),
                format!("{uid}:{gid}"),
                path.to_string(),
            ],
            user: Some("root".to_string()),
            binds: self.workspace_bind(),
            ..Default::default()
        };
        let ctr = docker::create_container(&self.docker, spec).await?;
        let result = docker::run_container(&self.docker, &ctr, "chown").await;
        let _ = docker::remove_container(&self.docker, &ctr, true).await;
        result?;
        Ok(())
    }
}

/// Resolve the `--path` flag: empty or the sentinel means the current
/// working directory; the result is absolute.
pub fn resolve_app_dir(flag: &str) -> Result<PathBuf> {
    let dir = if flag.is_empty() || flag == CWD_PLACEHOLDER {
        std::env::current_dir().context("determining current working directory")?
    } else {
        PathBuf::from(flag)
    };
    dir.canonicalize()
        .with_context(|| format!("app directory {} does not exist", dir.display()))
}

/// The fallback repository name for a build without one.
pub fn default_repo_name(app_dir: &Path) -> String {
    format!(
        "pack.local/run/{:x}",
        md5::compute(app_dir.display().to_string())
    )
}

/// Split `id[@version]`; a missing version becomes `latest`.
pub fn parse_buildpack_ref(reference: &str) -> (String, String) {
    match reference.split_once('@') {
        Some((id, version)) => (id.to_string(), version.to_string()),
        None => (reference.to_string(), "latest".to_string()),
    }
}

/// Parse an env file: `KEY=VALUE` lines, bare `KEY` pulled from the
/// process environment, empty lines skipped.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => out.insert(key.to_string(), value.to_string()),
            None => out.insert(
                line.to_string(),
                std::env::var(line).unwrap_or_default(),
            ),
        };
    }
    Ok(out)
}

/// Tar of `/platform/env/<KEY>` files, one per env entry, mode 0444.
fn tar_env_file(env: &BTreeMap<String, String>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (key, value) in env {
        let mut header = tar::Header::new_gnu();
        header.set_size(value.len() as u64);
        header.set_mode(0o444);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                format!("platform/env/{key}"),
                value.as_bytes(),
            )
            .with_context(|| format!("tar env file {key}"))?;
    }
    builder.into_inner().context("finishing env tar")
}

/// Parse `PACK_USER_ID`/`PACK_GROUP_ID` (fallback `PACK_USER_GID`) from
/// an image's env list.
pub fn parse_pack_uid_gid(env: &[String]) -> Result<(u32, u32)> {
    let mut user_id = None;
    let mut group_id = None;
    let mut user_gid = None;
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            match key {
                "PACK_USER_ID" => user_id = Some(value.to_string()),
                "PACK_GROUP_ID" => group_id = Some(value.to_string()),
                "PACK_USER_GID" => user_gid = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let uid_text = user_id.filter(|s| !s.is_empty());
    let gid_text = group_id.filter(|s| !s.is_empty()).or(user_gid);
    let (Some(uid_text), Some(gid_text)) = (uid_text, gid_text) else {
        bail!("not found pack uid & gid");
    };

    let uid = uid_text
        .parse::<u32>()
        .map_err(|e| anyhow!("parsing pack uid: {uid_text}: {e}"))?;
    let gid = gid_text
        .parse::<u32>()
        .map_err(|e| anyhow!("parsing pack gid: {gid_text}: {e}"))?;
    Ok((uid, gid))
}

fn stack_id_of(image: &dyn Image, kind: &str) -> Result<String> {
    let stack_id = image
        .label(STACK_ID_LABEL)
        .map_err(|e| anyhow!("invalid {kind} image \"{}\": {e}", image.name()))?;
    if stack_id.is_empty() {
        bail!(
            "invalid {kind} image \"{}\": missing required label \"{STACK_ID_LABEL}\"",
            image.name()
        );
    }
    Ok(stack_id)
}

fn stack_mismatch_error(
    run_stack: &str,
    run_image: &str,
    builder_stack: &str,
    builder: &str,
) -> anyhow::Error {
    anyhow!(
        "invalid stack: stack \"{run_stack}\" from run image \"{run_image}\" does not match stack \"{builder_stack}\" from builder image \"{builder}\""
    )
}

/// The auth header handed to the lifecycle in publish mode. Resolved
/// from the caller's environment; the client itself never authenticates.
fn registry_auth_header() -> String {
    std::env::var("PACK_REGISTRY_AUTH").unwrap_or_default()
}
