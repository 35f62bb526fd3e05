//! Configuration schema for pack
//!
//! Defines the structure and defaults for `config.toml`.

use serde::{Deserialize, Serialize};

/// A stack: an id plus the candidate build and run images that share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    #[serde(rename = "build-images", default)]
    pub build_images: Vec<String>,
    #[serde(rename = "run-images", default)]
    pub run_images: Vec<String>,
}

/// Main configuration structure for pack.
///
/// Serialized to/from `$PACK_HOME/config.toml` (default `~/.pack/config.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "default-stack-id", default)]
    pub default_stack_id: String,

    #[serde(
        rename = "default-builder",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_builder: Option<String>,

    #[serde(default)]
    pub stacks: Vec<Stack>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_kebab_case_keys() {
        let config: Config = toml::from_str(
            r#"
default-stack-id = "io.buildpacks.stacks.bionic"
default-builder = "packs/samples"

[[stacks]]
id = "io.buildpacks.stacks.bionic"
build-images = ["packs/build"]
run-images = ["packs/run", "registry.com/packs/run"]
"#,
        )
        .unwrap();

        assert_eq!(config.default_stack_id, "io.buildpacks.stacks.bionic");
        assert_eq!(config.default_builder.as_deref(), Some("packs/samples"));
        assert_eq!(config.stacks.len(), 1);
        assert_eq!(config.stacks[0].build_images, vec!["packs/build"]);
        assert_eq!(
            config.stacks[0].run_images,
            vec!["packs/run", "registry.com/packs/run"]
        );
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let config = Config {
            default_stack_id: "some.stack.id".to_string(),
            default_builder: Some("some/builder".to_string()),
            stacks: vec![Stack {
                id: "some.stack.id".to_string(),
                build_images: vec!["some/build".to_string()],
                run_images: vec!["some/run".to_string()],
            }],
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn missing_optional_fields_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.default_stack_id, "");
        assert!(config.default_builder.is_none());
        assert!(config.stacks.is_empty());
    }
}
