//! Docker operations module
//!
//! This module provides everything pack asks of the container runtime:
//! - Docker client wrapper with connection handling
//! - Docker-specific error types
//! - Ephemeral phase containers (create, copy-in, run, remove)
//! - Image pull/inspect helpers
//! - Cache volume management

mod client;
mod error;

pub mod container;
pub mod image;
pub mod volume;

pub use client::DockerClient;
pub use container::{ContainerSpec, copy_to_container, create_container, remove_container, run_container};
pub use error::DockerError;
pub use image::{image_exists, inspect_image, pull_image};
pub use volume::{cache_volume_name, ensure_volume, remove_volume};
