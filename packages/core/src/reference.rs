//! Image reference parsing
//!
//! A minimal parser for `[registry/]repository[:tag][@digest]` references.
//! Its main job is registry extraction: run images are selected from a
//! stack by matching registries, and rebase locates the new base the same
//! way.

/// Registry assumed when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference string.
    ///
    /// The first path component counts as a registry when it looks like a
    /// hostname (contains `.` or `:`, or is `localhost`); otherwise the
    /// whole reference is a repository on the default registry.
    pub fn parse(reference: &str) -> Self {
        let (rest, digest) = match reference.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (reference, None),
        };

        let (registry, remainder) = match rest.split_once('/') {
            Some((first, tail)) if looks_like_registry(first) => {
                (first.to_string(), tail.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest.to_string()),
        };

        // A tag separator must come after the last path separator, so that
        // a registry port is not mistaken for a tag.
        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => {
                (repo.to_string(), Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        Self {
            registry,
            repository,
            tag,
            digest,
        }
    }

    /// The tag to use when talking to a daemon or registry.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// The registry a reference points at.
pub fn registry_of(reference: &str) -> String {
    ImageRef::parse(reference).registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_repository_uses_default_registry() {
        let parsed = ImageRef::parse("some/app");
        assert_eq!(parsed.registry, DEFAULT_REGISTRY);
        assert_eq!(parsed.repository, "some/app");
        assert_eq!(parsed.tag, None);
        assert_eq!(parsed.tag_or_latest(), "latest");
    }

    #[test]
    fn hostname_first_segment_is_a_registry() {
        let parsed = ImageRef::parse("registry.com/some/run:v1");
        assert_eq!(parsed.registry, "registry.com");
        assert_eq!(parsed.repository, "some/run");
        assert_eq!(parsed.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn localhost_with_port_is_a_registry() {
        let parsed = ImageRef::parse("localhost:5000/some/app");
        assert_eq!(parsed.registry, "localhost:5000");
        assert_eq!(parsed.repository, "some/app");
        assert_eq!(parsed.tag, None);
    }

    #[test]
    fn digest_is_split_off() {
        let parsed = ImageRef::parse("some/app@sha256:abcd");
        assert_eq!(parsed.repository, "some/app");
        assert_eq!(parsed.digest.as_deref(), Some("sha256:abcd"));
    }

    #[test]
    fn registry_of_matches_parse() {
        assert_eq!(registry_of("registry.com/some/app"), "registry.com");
        assert_eq!(registry_of("some/app"), DEFAULT_REGISTRY);
    }
}
