//! Run command implementation

use anyhow::Result;
use clap::Args;
use pack_core::RunFlags;
use pack_core::build::CWD_PLACEHOLDER;

/// Arguments for the run command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the app directory
    #[arg(short = 'p', long = "path", default_value = CWD_PLACEHOLDER)]
    pub path: String,

    /// Builder image
    #[arg(long)]
    pub builder: Option<String>,

    /// Run image to layer the app on
    #[arg(long = "run-image")]
    pub run_image: Option<String>,

    /// Comma separated ports to publish; defaults to the ports exposed
    /// by the built image
    #[arg(long)]
    pub port: Option<String>,
}

pub async fn cmd_run(args: &RunArgs) -> Result<()> {
    let factory = super::build_factory().await?;
    let config = factory
        .run_config(RunFlags {
            app_dir: args.path.clone(),
            builder: args.builder.clone().unwrap_or_default(),
            run_image: args.run_image.clone().unwrap_or_default(),
            port: args.port.clone().unwrap_or_default(),
        })
        .await?;

    config.run().await
}
