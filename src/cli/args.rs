//! CLI argument parsing structures.

use clap::{Args, Parser};
use std::path::PathBuf;

use super::commands::Commands;

/// Main CLI structure for stax.
#[derive(Parser, Debug)]
#[command(name = "stax", version)]
#[command(about = "Pull a WP Engine site into a local ddev environment", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options available to every command.
#[derive(Debug, Default, Args)]
pub struct GlobalArgs {
    /// Config file to use instead of the search path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Project from the config file (defaults to default_project or the only project)
    #[arg(short, long, global = true)]
    pub project: Option<String>,

    /// Log at debug level (STAX_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}
