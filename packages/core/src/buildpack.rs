//! Buildpack metadata and detection-order types
//!
//! These structs mirror the TOML documents that flow between pack and the
//! lifecycle binaries: `buildpack.toml` inside a buildpack directory,
//! `order.toml` baked into a builder image, and `group.toml` written by
//! the detector into the workspace.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single buildpack reference inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackRef {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

/// An ordered list of buildpacks tried together during detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackGroup {
    pub buildpacks: Vec<BuildpackRef>,
}

/// The detection order: the document encoded as `/buildpacks/order.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub groups: Vec<BuildpackGroup>,
}

impl Order {
    pub fn encode(&self) -> Result<String> {
        toml::to_string(self).context("encoding order.toml")
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing order.toml")
    }
}

/// The `[buildpack]` table of a `buildpack.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackInfo {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A stack-compatibility entry of a `buildpack.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackStack {
    pub id: String,
}

/// A parsed `buildpack.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackToml {
    pub buildpack: BuildpackInfo,
    #[serde(default)]
    pub stacks: Vec<BuildpackStack>,
}

impl BuildpackToml {
    /// Read and parse `<dir>/buildpack.toml`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("buildpack.toml");
        let text = std::fs::read_to_string(&path).map_err(|e| {
            anyhow!(
                "reading buildpack.toml from buildpack: {}: {e}",
                path.display()
            )
        })?;
        toml::from_str(&text).map_err(|e| {
            anyhow!(
                "reading buildpack.toml from buildpack: {}: {e}",
                path.display()
            )
        })
    }
}

/// Escape a buildpack id for use as a filesystem path segment.
///
/// The lifecycle inside the builder image applies the same rule, so the
/// escape must stay exactly `/` -> `_`.
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> Order {
        Order {
            groups: vec![BuildpackGroup {
                buildpacks: vec![
                    BuildpackRef {
                        id: "io.buildpacks/nodejs".to_string(),
                        version: "0.0.1".to_string(),
                        optional: false,
                    },
                    BuildpackRef {
                        id: "io.buildpacks/npm".to_string(),
                        version: "0.0.2".to_string(),
                        optional: true,
                    },
                ],
            }],
        }
    }

    #[test]
    fn order_roundtrip_is_identity() {
        let order = sample_order();
        let encoded = order.encode().unwrap();
        let parsed = Order::parse(&encoded).unwrap();
        assert_eq!(parsed, order);
    }

    #[test]
    fn order_encodes_nested_group_tables() {
        let encoded = sample_order().encode().unwrap();
        assert!(encoded.contains("[[groups]]"));
        assert!(encoded.contains("[[groups.buildpacks]]"));
        assert!(encoded.contains("optional = true"));
    }

    #[test]
    fn escape_id_replaces_slashes_only() {
        assert_eq!(escape_id("io.buildpacks/nodejs"), "io.buildpacks_nodejs");
        assert_eq!(escape_id("mock.bp.first"), "mock.bp.first");
        assert_eq!(escape_id("a/b/c"), "a_b_c");
    }

    #[test]
    fn buildpack_toml_parses_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("buildpack.toml"),
            r#"
[buildpack]
id = "sample/java"
version = "0.0.3"
name = "Sample Java Buildpack"

[[stacks]]
id = "io.buildpacks.stacks.bionic"
"#,
        )
        .unwrap();

        let parsed = BuildpackToml::from_dir(dir.path()).unwrap();
        assert_eq!(parsed.buildpack.id, "sample/java");
        assert_eq!(parsed.buildpack.version, "0.0.3");
        assert_eq!(parsed.stacks.len(), 1);
    }

    #[test]
    fn buildpack_toml_missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuildpackToml::from_dir(dir.path()).unwrap_err();
        assert!(
            err.to_string()
                .starts_with("reading buildpack.toml from buildpack")
        );
    }
}
