//! Create-builder command implementation

use anyhow::Result;
use clap::Args;
use pack_core::{BuilderFactory, CreateBuilderFlags};

/// Arguments for the create-builder command
#[derive(Args, Debug)]
pub struct CreateBuilderArgs {
    /// Builder image name to create
    pub image: String,

    /// Path to the builder.toml file
    #[arg(short = 'b', long = "builder-config")]
    pub builder_config: String,

    /// Stack whose build image the builder is based on
    #[arg(short = 's', long = "stack", default_value = "")]
    pub stack: String,

    /// Publish to a registry instead of the daemon
    #[arg(long)]
    pub publish: bool,

    /// Don't pull the stack build image before use
    #[arg(long = "no-pull")]
    pub no_pull: bool,
}

pub async fn cmd_create_builder(args: &CreateBuilderArgs) -> Result<()> {
    let factory = super::build_factory().await?;
    let factory = BuilderFactory::new(factory.docker, factory.config);

    factory
        .create(CreateBuilderFlags {
            repo_name: args.image.clone(),
            builder_toml_path: args.builder_config.clone(),
            stack_id: args.stack.clone(),
            publish: args.publish,
            no_pull: args.no_pull,
        })
        .await
}
