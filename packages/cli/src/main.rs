//! pack CLI - build, run, and rebase apps with Cloud Native Buildpacks
//!
//! This is the main entry point for the pack binary.

use console::style;

fn main() {
    if let Err(err) = pack_cli::run() {
        eprintln!("{} {err:#}", style("ERROR:").red().bold());
        std::process::exit(1);
    }
}
