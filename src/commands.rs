//! CLI command definitions
//!
//! Defines the clap commands for the devicelab CLI.

use clap::Subcommand;
use std::path::PathBuf;

use crate::build::Platform;

#[derive(Subcommand)]
pub enum Commands {
    /// List the builds found under a directory
    Builds {
        /// Directory to search
        path: PathBuf,

        /// Project name used in build and package names
        #[arg(long, short)]
        project: String,

        /// How many directory levels below PATH to search
        #[arg(long, default_value_t = crate::session::DEFAULT_MAX_RECURSION)]
        max_depth: usize,

        /// Only show builds for this platform
        #[arg(long)]
        platform: Option<Platform>,
    },

    /// Show the configured device pool and the supported platforms
    Devices,

    /// Summarize an application log
    ParseLog {
        /// Log file to parse
        file: PathBuf,

        /// Print the lines logged to these channels (e.g. --channel Automation)
        #[arg(long, short)]
        channel: Vec<String>,

        /// Print the callstack of the fatal error and every ensure
        #[arg(long)]
        callstacks: bool,
    },

    /// Run a YAML test scenario
    Run {
        /// Scenario file
        scenario: PathBuf,

        /// Show setup output and per-role summaries
        #[arg(long, short)]
        verbose: bool,

        /// Directory for the persistent run log (default: the platform log dir)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}
