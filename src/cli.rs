use clap::{Parser, Subcommand};

use crate::output::OutputMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Stack file to use (before the subcommand; `logs -f` means follow)
    #[arg(short = 'f', long = "file", default_value = "stack.toml")]
    pub file: String,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Override number of tasks that may run at once
    #[arg(short = 'j', long = "workers", global = true)]
    pub workers: Option<usize>,

    /// Override default command timeout (e.g., "5m", "30s", "1h30m")
    #[arg(short = 't', long = "timeout", global = true)]
    pub timeout: Option<String>,

    /// Stop scheduling new tasks after the first failure
    #[arg(long = "fail-fast", global = true)]
    pub fail_fast: bool,

    /// Show what would be executed without running tasks
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,

    /// How to display task output in the terminal
    #[arg(long = "output", value_enum, global = true)]
    pub output: Option<OutputMode>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Prepare env files, dependencies and databases
    Setup,
    /// Start the whole stack and stay attached to local processes
    Up,
    /// Stop every service
    Down,
    /// Stop, then start the stack again
    Restart,
    /// Start one service and whatever it depends on
    Run {
        /// Service to start
        service: String,
    },
    /// Show the state of every service
    Status,
    /// Print a service's logs
    Logs {
        /// Service whose logs to print
        service: String,
        /// Keep printing new lines until interrupted
        #[arg(short = 'f', long = "follow")]
        follow: bool,
    },
    /// Run tasks by id
    Exec {
        /// Tasks to run, along with their dependencies
        #[arg(required = true)]
        tasks: Vec<String>,
    },
}
