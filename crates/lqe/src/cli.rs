//! CLI argument definitions using clap derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Layered Query Engine CLI
///
/// Runs the adaptive strategy selector, worker pool and cross-layer cache
/// against simulated memory layers.
#[derive(Parser, Debug)]
#[command(name = "lqe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to an engine config file (overrides LQE_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulated workload and report what the engine learned
    Simulate(SimulateArgs),

    /// Inspect engine configuration
    Config(ConfigCommand),

    /// Show version information
    Version,
}

// ─────────────────────────────────────────────────────────────────────────────
// Simulate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of queries to run
    #[arg(short = 'n', long, default_value = "60")]
    pub queries: usize,

    /// Queries in flight at once
    #[arg(short = 'j', long, default_value = "4")]
    pub concurrency: usize,

    /// RNG seed for a reproducible run
    #[arg(long)]
    pub seed: Option<u64>,

    /// Probability that any single layer call fails
    #[arg(long, default_value = "0.02")]
    pub failure_rate: f64,

    /// Share of queries that repeat an earlier query's parameters
    #[arg(long, default_value = "0.5")]
    pub repeat_ratio: f64,

    /// Per-layer call timeout in milliseconds
    #[arg(long, default_value = "2000")]
    pub layer_timeout_ms: u64,

    /// Print each query's decision as it completes
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit the final report as JSON
    #[arg(long)]
    pub json: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Validate a config file without running anything
    Validate {
        /// File to validate (defaults to the active config path)
        path: Option<PathBuf>,
    },

    /// Print the config file path in use
    Path,
}
