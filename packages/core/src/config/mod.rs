//! On-disk configuration: stacks, default stack, default builder
//!
//! The config lives at `$PACK_HOME/config.toml` (default
//! `~/.pack/config.toml`). Loading seeds the file with the bionic stack
//! on first use and writes the result back, so every command sees a valid
//! configuration. Stacks are immutable for the duration of a build.

mod schema;

pub use schema::{Config, Stack};

use crate::reference::registry_of;
use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};

/// Stack seeded into a fresh configuration.
const DEFAULT_STACK_ID: &str = "io.buildpacks.stacks.bionic";

/// Resolve the pack home directory: `$PACK_HOME`, else `~/.pack`.
pub fn pack_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("PACK_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".pack"))
        .ok_or_else(|| anyhow!("could not determine home directory"))
}

/// A loaded configuration plus the path it persists to.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    pub config: Config,
    path: PathBuf,
}

impl ConfigStore {
    /// Load (or create) the config under `dir`, seeding defaults.
    pub fn new(dir: &Path) -> Result<Self> {
        let path = dir.join("config.toml");
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        if config.default_stack_id.is_empty() {
            config.default_stack_id = DEFAULT_STACK_ID.to_string();
        }
        if !config.stacks.iter().any(|s| s.id == DEFAULT_STACK_ID) {
            config.stacks.push(Stack {
                id: DEFAULT_STACK_ID.to_string(),
                build_images: vec!["packs/build".to_string()],
                run_images: vec!["packs/run".to_string()],
            });
        }

        let store = Self { config, path };
        store.save()?;
        Ok(store)
    }

    /// Load from the default pack home.
    pub fn new_default() -> Result<Self> {
        Self::new(&pack_home()?)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = toml::to_string(&self.config).context("encoding config.toml")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// Look up a stack by id; an empty id means the default stack.
    pub fn get_stack(&self, stack_id: &str) -> Result<&Stack> {
        let id = if stack_id.is_empty() {
            &self.config.default_stack_id
        } else {
            stack_id
        };
        self.config
            .stacks
            .iter()
            .find(|s| s.id == *id)
            .ok_or_else(|| {
                anyhow!(r#"Missing stack: stack with id "{id}" not found in pack config.toml"#)
            })
    }

    pub fn add_stack(&mut self, stack: Stack) -> Result<()> {
        if self.config.stacks.iter().any(|s| s.id == stack.id) {
            bail!(r#"stack "{}" already exists"#, stack.id);
        }
        self.config.stacks.push(stack);
        self.save()
    }

    pub fn update_stack(
        &mut self,
        stack_id: &str,
        build_images: Vec<String>,
        run_images: Vec<String>,
    ) -> Result<()> {
        let stack = self
            .config
            .stacks
            .iter_mut()
            .find(|s| s.id == stack_id)
            .ok_or_else(|| {
                anyhow!(
                    r#"Missing stack: stack with id "{stack_id}" not found in pack config.toml"#
                )
            })?;
        if !build_images.is_empty() {
            stack.build_images = build_images;
        }
        if !run_images.is_empty() {
            stack.run_images = run_images;
        }
        self.save()
    }

    pub fn delete_stack(&mut self, stack_id: &str) -> Result<()> {
        if stack_id == self.config.default_stack_id {
            bail!(r#"stack "{stack_id}" is the default stack and cannot be deleted"#);
        }
        let before = self.config.stacks.len();
        self.config.stacks.retain(|s| s.id != stack_id);
        if self.config.stacks.len() == before {
            bail!(r#"Missing stack: stack with id "{stack_id}" not found in pack config.toml"#);
        }
        self.save()
    }

    pub fn set_default_stack(&mut self, stack_id: &str) -> Result<()> {
        self.get_stack(stack_id)?;
        self.config.default_stack_id = stack_id.to_string();
        self.save()
    }

    pub fn set_default_builder(&mut self, builder: &str) -> Result<()> {
        self.config.default_builder = Some(builder.to_string());
        self.save()
    }

    /// The stack (if any) whose run images contain `run_image`.
    pub fn stack_by_run_image(&self, run_image: &str) -> Option<&Stack> {
        self.config
            .stacks
            .iter()
            .find(|s| s.run_images.iter().any(|i| i == run_image))
    }
}

/// Pick the image whose registry matches, else the first entry.
pub fn image_by_registry(registry: &str, images: &[String]) -> Result<String> {
    if images.is_empty() {
        bail!("empty images");
    }
    for image in images {
        if registry_of(image) == registry {
            return Ok(image.clone());
        }
    }
    Ok(images[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_seeds_default_stack_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path()).unwrap();

        assert_eq!(store.config.default_stack_id, DEFAULT_STACK_ID);
        let stack = store.get_stack("").unwrap();
        assert_eq!(stack.build_images, vec!["packs/build"]);
        assert_eq!(stack.run_images, vec!["packs/run"]);
        assert!(dir.path().join("config.toml").exists());
    }

    #[test]
    fn new_preserves_existing_stacks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
default-stack-id = "some.stack.id"

[[stacks]]
id = "some.stack.id"
build-images = ["some/build"]
run-images = ["some/run"]
"#,
        )
        .unwrap();

        let store = ConfigStore::new(dir.path()).unwrap();
        assert_eq!(store.config.default_stack_id, "some.stack.id");
        // The bionic stack is appended, never replacing user stacks.
        assert_eq!(store.config.stacks.len(), 2);
        assert_eq!(store.get_stack("some.stack.id").unwrap().run_images, vec!["some/run"]);
    }

    #[test]
    fn get_stack_missing_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path()).unwrap();
        let err = store.get_stack("does.not.exist").unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Missing stack: stack with id "does.not.exist" not found in pack config.toml"#
        );
    }

    #[test]
    fn add_update_delete_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new(dir.path()).unwrap();

        store
            .add_stack(Stack {
                id: "org.example.stack".to_string(),
                build_images: vec!["example/build".to_string()],
                run_images: vec!["example/run".to_string()],
            })
            .unwrap();
        assert!(store.add_stack(Stack {
            id: "org.example.stack".to_string(),
            build_images: vec![],
            run_images: vec![],
        }).is_err());

        store
            .update_stack(
                "org.example.stack",
                vec![],
                vec!["example/run2".to_string()],
            )
            .unwrap();
        let stack = store.get_stack("org.example.stack").unwrap();
        assert_eq!(stack.build_images, vec!["example/build"]);
        assert_eq!(stack.run_images, vec!["example/run2"]);

        store.delete_stack("org.example.stack").unwrap();
        assert!(store.get_stack("org.example.stack").is_err());

        // Reload from disk: mutations persisted.
        let reloaded = ConfigStore::new(dir.path()).unwrap();
        assert!(reloaded.get_stack("org.example.stack").is_err());
    }

    #[test]
    fn delete_default_stack_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new(dir.path()).unwrap();
        assert!(store.delete_stack(DEFAULT_STACK_ID).is_err());
    }

    #[test]
    fn set_default_stack_requires_existing_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new(dir.path()).unwrap();
        assert!(store.set_default_stack("nope").is_err());

        store
            .add_stack(Stack {
                id: "other.stack".to_string(),
                build_images: vec!["b".to_string()],
                run_images: vec!["r".to_string()],
            })
            .unwrap();
        store.set_default_stack("other.stack").unwrap();
        assert_eq!(store.config.default_stack_id, "other.stack");
    }

    #[test]
    fn set_default_builder_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new(dir.path()).unwrap();
        store.set_default_builder("some/builder").unwrap();

        let reloaded = ConfigStore::new(dir.path()).unwrap();
        assert_eq!(reloaded.config.default_builder.as_deref(), Some("some/builder"));
    }

    #[test]
    fn image_by_registry_prefers_matching_registry() {
        let images = vec![
            "some/run".to_string(),
            "registry.com/some/run".to_string(),
        ];
        assert_eq!(
            image_by_registry("registry.com", &images).unwrap(),
            "registry.com/some/run"
        );
        assert_eq!(
            image_by_registry("index.docker.io", &images).unwrap(),
            "some/run"
        );
    }

    #[test]
    fn image_by_registry_falls_back_to_first() {
        let images = vec!["some/run".to_string()];
        assert_eq!(
            image_by_registry("registry.com", &images).unwrap(),
            "some/run"
        );
        assert!(image_by_registry("registry.com", &[]).is_err());
    }
}
