//! Build command implementation

use anyhow::Result;
use clap::Args;
use console::style;
use pack_core::BuildFlags;
use pack_core::build::CWD_PLACEHOLDER;

/// Arguments for the build command
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Image name to build
    pub image: String,

    /// Path to the app directory
    #[arg(short = 'p', long = "path", default_value = CWD_PLACEHOLDER)]
    pub path: String,

    /// Builder image
    #[arg(long)]
    pub builder: Option<String>,

    /// Run image to layer the app on
    #[arg(long = "run-image")]
    pub run_image: Option<String>,

    /// Publish to a registry instead of the daemon
    #[arg(long)]
    pub publish: bool,

    /// Don't pull images before use
    #[arg(long = "no-pull")]
    pub no_pull: bool,

    /// Clear the build cache before detecting
    #[arg(long = "clear-cache")]
    pub clear_cache: bool,

    /// Buildpack to use instead of detection (ID[@VERSION] or a directory)
    #[arg(long = "buildpack")]
    pub buildpacks: Vec<String>,

    /// File with KEY=VALUE lines exposed to buildpacks as platform env
    #[arg(long = "env-file")]
    pub env_file: Option<String>,
}

pub async fn cmd_build(args: &BuildArgs) -> Result<()> {
    let factory = super::build_factory().await?;
    let config = factory
        .build_config(BuildFlags {
            app_dir: args.path.clone(),
            builder: args.builder.clone().unwrap_or_default(),
            run_image: args.run_image.clone().unwrap_or_default(),
            env_file: args.env_file.clone().unwrap_or_default(),
            repo_name: args.image.clone(),
            publish: args.publish,
            no_pull: args.no_pull,
            clear_cache: args.clear_cache,
            buildpacks: args.buildpacks.clone(),
        })
        .await?;

    config.run().await?;

    println!(
        "{} Successfully built image: {}",
        style("Success:").green().bold(),
        args.image
    );
    Ok(())
}
