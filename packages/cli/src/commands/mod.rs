//! CLI command implementations

mod build;
mod create_builder;
mod rebase;
mod run;
mod stacks;

pub use build::{BuildArgs, cmd_build};
pub use create_builder::{CreateBuilderArgs, cmd_create_builder};
pub use rebase::{RebaseArgs, cmd_rebase};
pub use run::{RunArgs, cmd_run};
pub use stacks::{
    AddStackArgs, DeleteStackArgs, SetDefaultBuilderArgs, SetDefaultStackArgs, UpdateStackArgs,
    cmd_add_stack, cmd_delete_stack, cmd_set_default_builder, cmd_set_default_stack,
    cmd_update_stack,
};

use anyhow::Result;
use pack_core::{BuildFactory, ConfigStore, DockerClient};

/// Connect to the daemon and load the configuration, the preamble every
/// image-touching command shares.
pub(crate) async fn build_factory() -> Result<BuildFactory> {
    let docker = DockerClient::new()?;
    docker.verify_connection().await?;
    let config = ConfigStore::new_default()?;
    Ok(BuildFactory::new(docker, config))
}
