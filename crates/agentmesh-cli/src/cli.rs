//! Clap CLI definitions for agentmesh.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  agentmesh run                 Run the mesh until Ctrl+C
  agentmesh run --demo          Run with two demo workers attached
  agentmesh demo                Run the demo scenario once and exit
  agentmesh config              Print the effective configuration
  agentmesh check               Validate the config file

Config is read from ~/.agentmesh/config.toml unless --config is given.
RUST_LOG overrides the configured log_level.";

/// agentmesh: in-process message bus, event system, and service registry.
#[derive(Parser)]
#[command(name = "agentmesh", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the mesh and run until interrupted.
    Run {
        /// Attach demo worker agents and drive a few requests through them.
        #[arg(long)]
        demo: bool,
        /// Seconds between statistics log lines (0 disables them).
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
    /// Run the demo scenario once, print a summary, and exit.
    Demo,
    /// Print the effective configuration.
    Config {
        /// Print as JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration file.
    Check,
}
