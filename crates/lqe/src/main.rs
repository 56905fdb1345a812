//! lqe - Layered Query Engine CLI
//!
//! Drives the adaptive executor from `lqe-core` against simulated memory
//! layers and inspects its configuration.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;
mod error;
mod sim;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive("lqe=info".parse()?)
                .add_directive("lqe_core=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config_path = config::config_path(cli.config.as_deref());

    // Execute command
    match cli.command {
        Commands::Simulate(args) => {
            let engine_config = config::load(&config_path)?;
            commands::simulate::execute(args, engine_config).await
        }
        Commands::Config(cmd) => commands::config::execute(cmd, &config_path),
        Commands::Version => {
            println!("lqe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
