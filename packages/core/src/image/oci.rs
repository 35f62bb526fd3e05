//! OCI image config documents and layer arithmetic
//!
//! The config blob structs are shared by both image backings: the daemon
//! handle serializes one into the archive it streams to the image-load
//! endpoint, the registry handle round-trips one through the blob store.
//! Field names follow the Docker/OCI wire format.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The `config` section of an image config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,

    #[serde(
        rename = "ExposedPorts",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

impl RuntimeConfig {
    pub fn label(&self, key: &str) -> String {
        self.labels
            .as_ref()
            .and_then(|labels| labels.get(key).cloned())
            .unwrap_or_default()
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.to_string());
    }
}

/// The `rootfs` section of an image config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub typ: String,
    pub diff_ids: Vec<String>,
}

/// A full image config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default)]
    pub config: RuntimeConfig,

    pub rootfs: RootFs,
}

impl ConfigFile {
    pub fn new(config: RuntimeConfig, diff_ids: Vec<String>) -> Self {
        Self {
            architecture: Some("amd64".to_string()),
            os: Some("linux".to_string()),
            // Fixed so identical inputs produce identical config blobs.
            created: Some("1970-01-01T00:00:00Z".to_string()),
            config,
            rootfs: RootFs {
                typ: "layers".to_string(),
                diff_ids,
            },
        }
    }
}

/// One entry of a `manifest.json` in the daemon load/save archive format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Locate `old_top` in a diff-id list and return the count of base
/// layers (index + 1).
pub fn base_layer_count(diff_ids: &[String], old_top: &str) -> Result<usize> {
    match diff_ids.iter().position(|id| id == old_top) {
        Some(index) => Ok(index + 1),
        None => bail!("rebase: old base top layer not found"),
    }
}

/// The diff-id list of a rebased image: the new base's list followed by
/// the target's app layers (everything above the old base).
pub fn splice_diff_ids(
    target: &[String],
    base: &[String],
    base_count: usize,
) -> Vec<String> {
    let mut spliced = base.to_vec();
    spliced.extend(target[base_count..].iter().cloned());
    spliced
}

/// Merge configs for rebase: the new base supplies env, user, working
/// dir, entrypoint and cmd only where the target never overrode them;
/// labels and exposed ports always come from the target.
pub fn merge_rebase_config(target: &RuntimeConfig, base: &RuntimeConfig) -> RuntimeConfig {
    fn pick<T: Clone>(target: &Option<T>, base: &Option<T>, is_empty: impl Fn(&T) -> bool) -> Option<T> {
        match target {
            Some(value) if !is_empty(value) => Some(value.clone()),
            _ => base.clone(),
        }
    }

    RuntimeConfig {
        user: pick(&target.user, &base.user, |s: &String| s.is_empty()),
        env: pick(&target.env, &base.env, |v: &Vec<String>| v.is_empty()),
        entrypoint: pick(&target.entrypoint, &base.entrypoint, |v: &Vec<String>| {
            v.is_empty()
        }),
        cmd: pick(&target.cmd, &base.cmd, |v: &Vec<String>| v.is_empty()),
        working_dir: pick(&target.working_dir, &base.working_dir, |s: &String| {
            s.is_empty()
        }),
        labels: target.labels.clone(),
        exposed_ports: target.exposed_ports.clone(),
    }
}

/// Convert a bollard inspect config into the wire-format runtime config.
pub fn runtime_config_from_inspect(config: &bollard::models::ImageConfig) -> RuntimeConfig {
    RuntimeConfig {
        user: config.user.clone(),
        env: config.env.clone(),
        entrypoint: config.entrypoint.clone(),
        cmd: config.cmd.clone(),
        working_dir: config.working_dir.clone(),
        labels: config.labels.clone(),
        exposed_ports: config.exposed_ports.as_ref().map(|ports| {
            ports
                .keys()
                .map(|port| (port.clone(), serde_json::json!({})))
                .collect()
        }),
    }
}
