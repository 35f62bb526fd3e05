//! Stack and default-builder configuration commands
//!
//! These only touch `config.toml`; no daemon connection is needed.

use anyhow::Result;
use clap::Args;
use pack_core::{ConfigStore, Stack};

/// Arguments for the add-stack command
#[derive(Args, Debug)]
pub struct AddStackArgs {
    /// Stack id
    pub id: String,

    /// Build image for builder images built with the stack
    #[arg(short = 'b', long = "build-image", required = true)]
    pub build_images: Vec<String>,

    /// Run image for runnable images built with the stack
    #[arg(short = 'r', long = "run-image", required = true)]
    pub run_images: Vec<String>,
}

/// Arguments for the update-stack command
#[derive(Args, Debug)]
pub struct UpdateStackArgs {
    /// Stack id
    pub id: String,

    /// Build image for builder images built with the stack
    #[arg(short = 'b', long = "build-image", required = true)]
    pub build_images: Vec<String>,

    /// Run image for runnable images built with the stack
    #[arg(short = 'r', long = "run-image", required = true)]
    pub run_images: Vec<String>,
}

/// Arguments for the delete-stack command
#[derive(Args, Debug)]
pub struct DeleteStackArgs {
    /// Stack id
    pub id: String,
}

/// Arguments for the set-default-stack command
#[derive(Args, Debug)]
pub struct SetDefaultStackArgs {
    /// Stack id
    pub id: String,
}

/// Arguments for the set-default-builder command
#[derive(Args, Debug)]
pub struct SetDefaultBuilderArgs {
    /// Builder image reference
    pub image: String,
}

pub fn cmd_add_stack(args: &AddStackArgs) -> Result<()> {
    let mut config = ConfigStore::new_default()?;
    config.add_stack(Stack {
        id: args.id.clone(),
        build_images: args.build_images.clone(),
        run_images: args.run_images.clone(),
    })?;
    println!("{} successfully added", args.id);
    Ok(())
}

pub fn cmd_update_stack(args: &UpdateStackArgs) -> Result<()> {
    let mut config = ConfigStore::new_default()?;
    config.update_stack(&args.id, args.build_images.clone(), args.run_images.clone())?;
    println!("{} successfully updated", args.id);
    Ok(())
}

pub fn cmd_delete_stack(args: &DeleteStackArgs) -> Result<()> {
    let mut config = ConfigStore::new_default()?;
    config.delete_stack(&args.id)?;
    println!("{} has been successfully deleted", args.id);
    Ok(())
}

pub fn cmd_set_default_stack(args: &SetDefaultStackArgs) -> Result<()> {
    let mut config = ConfigStore::new_default()?;
    config.set_default_stack(&args.id)?;
    println!("{} is now the default stack", args.id);
    Ok(())
}

pub fn cmd_set_default_builder(args: &SetDefaultBuilderArgs) -> Result<()> {
    let mut config = ConfigStore::new_default()?;
    config.set_default_builder(&args.image)?;
    println!("Builder {} is now the default builder", args.image);
    Ok(())
}
