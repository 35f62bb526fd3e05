//! pack CLI - build, run, and rebase apps with Cloud Native Buildpacks
//!
//! This module contains the shared CLI implementation used by the binary.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap::error::ErrorKind;

/// Build, run, and rebase app images with Cloud Native Buildpacks
#[derive(Parser)]
#[command(name = "pack")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, run, and rebase app images with Cloud Native Buildpacks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an app image from source
    Build(commands::BuildArgs),
    /// Build an app image and run it
    Run(commands::RunArgs),
    /// Rebase an app image onto a fresh run image
    Rebase(commands::RebaseArgs),
    /// Create a builder image from a builder TOML
    CreateBuilder(commands::CreateBuilderArgs),
    /// Add a stack to the configuration
    AddStack(commands::AddStackArgs),
    /// Update a stack's build and run images
    UpdateStack(commands::UpdateStackArgs),
    /// Remove a stack from the configuration
    DeleteStack(commands::DeleteStackArgs),
    /// Set the default stack
    SetDefaultStack(commands::SetDefaultStackArgs),
    /// Set the default builder image
    SetDefaultBuilder(commands::SetDefaultBuilderArgs),
    /// Show the pack version
    Version,
}

pub fn run() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit();
        }
        Err(err) => {
            let _ = err.print();
            eprintln!("Run 'pack --help' for usage.");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Build(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::cmd_build(&args))
        }
        Commands::Run(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::cmd_run(&args))
        }
        Commands::Rebase(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::cmd_rebase(&args))
        }
        Commands::CreateBuilder(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::cmd_create_builder(&args))
        }
        Commands::AddStack(args) => commands::cmd_add_stack(&args),
        Commands::UpdateStack(args) => commands::cmd_update_stack(&args),
        Commands::DeleteStack(args) => commands::cmd_delete_stack(&args),
        Commands::SetDefaultStack(args) => commands::cmd_set_default_stack(&args),
        Commands::SetDefaultBuilder(args) => commands::cmd_set_default_builder(&args),
        Commands::Version => {
            println!("VERSION: {}", pack_core::get_version());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pack_core::build::CWD_PLACEHOLDER;

    #[test]
    fn build_parses_flags_and_defaults() {
        let cli = Cli::try_parse_from([
            "pack",
            "build",
            "some/app",
            "--builder",
            "some/builder",
            "--buildpack",
            "mock.bp.first",
            "--buildpack",
            "mock.bp.third@0.0.3-mock",
            "--clear-cache",
        ])
        .unwrap();

        let Commands::Build(args) = cli.command else {
            panic!("expected build command");
        };
        assert_eq!(args.image, "some/app");
        assert_eq!(args.path, CWD_PLACEHOLDER);
        assert_eq!(args.builder.as_deref(), Some("some/builder"));
        assert_eq!(
            args.buildpacks,
            vec!["mock.bp.first", "mock.bp.third@0.0.3-mock"]
        );
        assert!(args.clear_cache);
        assert!(!args.publish);
        assert!(!args.no_pull);
    }

    #[test]
    fn build_requires_an_image() {
        assert!(Cli::try_parse_from(["pack", "build"]).is_err());
    }

    #[test]
    fn add_stack_requires_build_and_run_images() {
        assert!(Cli::try_parse_from(["pack", "add-stack", "some.stack"]).is_err());

        let cli = Cli::try_parse_from([
            "pack",
            "add-stack",
            "some.stack",
            "-b",
            "some/build",
            "-r",
            "some/run",
            "-r",
            "registry.com/some/run",
        ])
        .unwrap();
        let Commands::AddStack(args) = cli.command else {
            panic!("expected add-stack command");
        };
        assert_eq!(args.build_images, vec!["some/build"]);
        assert_eq!(args.run_images, vec!["some/run", "registry.com/some/run"]);
    }

    #[test]
    fn create_builder_requires_builder_config() {
        assert!(Cli::try_parse_from(["pack", "create-builder", "some/builder"]).is_err());
        let cli = Cli::try_parse_from([
            "pack",
            "create-builder",
            "some/builder",
            "-b",
            "builder.toml",
            "-s",
            "some.stack.id",
        ])
        .unwrap();
        let Commands::CreateBuilder(args) = cli.command else {
            panic!("expected create-builder command");
        };
        assert_eq!(args.builder_config, "builder.toml");
        assert_eq!(args.stack, "some.stack.id");
    }

    #[test]
    fn rebase_parses_publish_and_no_pull() {
        let cli =
            Cli::try_parse_from(["pack", "rebase", "some/app", "--publish", "--no-pull"]).unwrap();
        let Commands::Rebase(args) = cli.command else {
            panic!("expected rebase command");
        };
        assert_eq!(args.image, "some/app");
        assert!(args.publish);
        assert!(args.no_pull);
    }
}
