//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-process stress-testing harness for OS facilities.
#[derive(Parser, Debug)]
#[command(name = "pummel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a stressor under the supervision core.
    Run(RunArgs),

    /// List the registered stressors.
    List,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Name of the stressor to run.
    pub stressor: String,

    /// Number of worker instances to spawn.
    #[arg(short, long, default_value_t = 1)]
    pub workers: u32,

    /// Stop after this many seconds. Without a timeout or an op budget
    /// the run continues until interrupted.
    #[arg(short = 't', long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Stop each instance after this many bogo-operations.
    #[arg(long, value_name = "N")]
    pub ops: Option<u64>,

    /// Write a JSON metrics report to this file after the run.
    #[arg(long, value_name = "FILE")]
    pub metrics_out: Option<PathBuf>,
}
