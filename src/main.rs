//! entangle - run lazy task graphs across worker processes.

mod cli;
mod scenarios;

use anyhow::Result;
use clap::Parser;
use entangle::logging::{self, LogConfig};
use entangle::{Runtime, RuntimeConfig, TaskOptions};
use owo_colors::{OwoColorize, Stream::Stderr};
use std::time::Duration;

use cli::{Cli, Commands, RunArgs};

/// Parse arguments, set up logging, run the command, and report errors with
/// their cause chain before exiting non-zero.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
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

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::from_verbosity(cli.verbose).with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config);
}

/// Runtime settings from the environment, overridden by flags.
fn runtime_config(args: &RunArgs) -> RuntimeConfig {
    let mut config = RuntimeConfig::new().with_env_overrides();
    if let Some(ms) = args.poll_interval_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    if let Some(cpus) = args.cpus {
        config = config.with_cpus(cpus);
    }
    if let Some(executor) = args.executor {
        config = config.with_executor(executor);
    }
    config
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = runtime_config(args);
    let options = TaskOptions::new().with_shared_memory(args.shared_memory);
    let thunk = scenarios::build(&args.scenario, &options);
    tracing::info!(graph = ?thunk, executor = %config.executor, "Resolving");

    let resolved = Runtime::new(config).resolve_with_report(&thunk)?;
    println!("{}", serde_json::to_string(&resolved.value)?);
    if args.report {
        println!("{}", serde_json::to_string(&resolved.report)?);
    }
    Ok(())
}
