//! pummel - multi-process stress-testing harness

mod cli;
mod error;
mod harness;
mod logging;
mod report;
mod stressor;

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands, RunArgs};
use error::PummelError;
use harness::RunConfig;
use logging::LogConfig;
use report::RunReport;

fn main() {
    let cli = Cli::parse();

    logging::init(LogConfig::from_verbosity(cli.verbose, cli.quiet).with_env_overrides());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::List => cmd_list(),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            // Print the error chain if there are causes
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

/// Run a stressor and report; the process exit code is the merged run
/// status.
fn cmd_run(args: &RunArgs) -> Result<i32> {
    let stressor = stressor::find(&args.stressor)
        .ok_or_else(|| PummelError::UnknownStressor(args.stressor.clone()))?;

    let config = RunConfig {
        workers: args.workers,
        timeout: args.timeout.map(Duration::from_secs),
        max_ops: args.ops,
    };

    let started_at = Utc::now();
    let results = harness::run(stressor, &config)?;

    let report = RunReport::from_results(&results, started_at);
    report.log_summary();
    if let Some(path) = &args.metrics_out {
        report.write_json(path)?;
        tracing::info!(path = %path.display(), "metrics report written");
    }

    Ok(results.status.code())
}

/// Print the registered stressors.
fn cmd_list() -> Result<i32> {
    for stressor in stressor::REGISTRY {
        println!("{:<12} {}", stressor.name(), stressor.description());
    }
    Ok(0)
}
