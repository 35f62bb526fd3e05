//! pack-core
//!
//! Core library for the pack CLI: turns an application directory into a
//! runnable OCI image by orchestrating the buildpack lifecycle phases
//! inside ephemeral containers, assembles builder images from buildpack
//! bundles, and rebases app images onto fresh run images.

pub mod archive;
pub mod build;
pub mod builder;
pub mod buildpack;
pub mod config;
pub mod docker;
pub mod image;
pub mod rebase;
pub mod reference;
pub mod run;

// Re-exported so the CLI can name daemon types without its own
// dependency on the client crate.
pub use bollard;

pub use build::{BuildConfig, BuildFactory, BuildFlags};
pub use builder::{BuilderFactory, CreateBuilderFlags};
pub use config::{Config, ConfigStore, Stack};
pub use docker::{DockerClient, DockerError};
pub use image::{Image, ImageFactory};
pub use rebase::{RebaseFactory, RebaseFlags};
pub use run::{RunConfig, RunFlags};

/// The crate version, surfaced by `pack version`.
pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
