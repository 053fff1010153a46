//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use entangle::ExecutorKind;
use entangle::logging::LogFormat;
use std::path::PathBuf;

/// Run lazy task graphs across worker processes.
#[derive(Parser, Debug)]
#[command(name = "entangle")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format (pretty, compact, json).
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve one of the built-in example graphs.
    Run(RunArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(subcommand)]
    pub scenario: Scenario,

    /// Give up waiting on arguments after this many milliseconds (0 = never).
    #[arg(long, env = "ENTANGLE_TIMEOUT_MS", global = true)]
    pub timeout_ms: Option<u64>,

    /// Sleep between polling rounds, in milliseconds.
    #[arg(long, env = "ENTANGLE_POLL_INTERVAL_MS", global = true)]
    pub poll_interval_ms: Option<u64>,

    /// Pass intermediate results through shared memory segments.
    #[arg(long, global = true)]
    pub shared_memory: bool,

    /// How workers are started (fork, thread).
    #[arg(long, global = true)]
    pub executor: Option<ExecutorKind>,

    /// Cap the summed CPU hints of concurrently running workers.
    #[arg(long, env = "ENTANGLE_CPUS", global = true)]
    pub cpus: Option<usize>,

    /// Print the resolution report after the result.
    #[arg(long, global = true)]
    pub report: bool,
}

/// Built-in example graphs.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    /// add(three(), two())
    Add,

    /// sum(square(1), ..., square(n)), one worker per square.
    FanOut {
        /// Number of square workers.
        #[arg(default_value_t = 4)]
        n: usize,
    },

    /// emit(input), then route to printx or printy depending on the result.
    Branch {
        /// Input to emit; "emit" takes the printx branch.
        input: String,
    },

    /// A graph whose only argument never finishes; pair with --timeout-ms.
    Stall {
        /// How long the stalled worker sleeps.
        #[arg(long, default_value_t = 60_000)]
        stall_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_add() {
        let args = Cli::try_parse_from(["entangle", "run", "add"]).unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.scenario, Scenario::Add);
                assert!(!run.shared_memory);
                assert!(!run.report);
                assert_eq!(run.executor, None);
            }
        }
    }

    #[test]
    fn test_run_fan_out_with_options() {
        let args = Cli::try_parse_from([
            "entangle",
            "run",
            "fan-out",
            "6",
            "--shared-memory",
            "--executor",
            "thread",
            "--cpus",
            "2",
            "--report",
        ])
        .unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.scenario, Scenario::FanOut { n: 6 });
                assert!(run.shared_memory);
                assert_eq!(run.executor, Some(ExecutorKind::Thread));
                assert_eq!(run.cpus, Some(2));
                assert!(run.report);
            }
        }
    }

    #[test]
    fn test_fan_out_default_count() {
        let args = Cli::try_parse_from(["entangle", "run", "fan-out"]).unwrap();
        let Commands::Run(run) = args.command;
        assert_eq!(run.scenario, Scenario::FanOut { n: 4 });
    }

    #[test]
    fn test_global_flags() {
        let args = Cli::try_parse_from([
            "entangle",
            "run",
            "stall",
            "--timeout-ms",
            "100",
            "-vv",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.log_format, Some(LogFormat::Json));
        let Commands::Run(run) = args.command;
        assert_eq!(run.timeout_ms, Some(100));
        assert_eq!(run.scenario, Scenario::Stall { stall_ms: 60_000 });
    }

    #[test]
    fn test_unknown_executor_rejected() {
        assert!(Cli::try_parse_from(["entangle", "run", "add", "--executor", "ssh"]).is_err());
    }
}
