//! Rebase command implementation

use anyhow::Result;
use clap::Args;
use pack_core::{RebaseFactory, RebaseFlags};

/// Arguments for the rebase command
#[derive(Args, Debug)]
pub struct RebaseArgs {
    /// Image name to rebase
    pub image: String,

    /// Publish to a registry instead of the daemon
    #[arg(long)]
    pub publish: bool,

    /// Don't pull images before use
    #[arg(long = "no-pull")]
    pub no_pull: bool,
}

pub async fn cmd_rebase(args: &RebaseArgs) -> Result<()> {
    let factory = super::build_factory().await?;
    let factory = RebaseFactory::new(factory.docker, factory.config);

    let digest = factory
        .rebase(RebaseFlags {
            repo_name: args.image.clone(),
            publish: args.publish,
            no_pull: args.no_pull,
        })
        .await?;

    println!("New image digest: {digest}");
    Ok(())
}
