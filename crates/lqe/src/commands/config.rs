//! Configuration inspection commands.

use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::cli::{ConfigAction, ConfigCommand};
use crate::config;
use crate::error::CliError;

pub fn execute(cmd: ConfigCommand, config_path: &Path) -> Result<()> {
    match cmd.action {
        ConfigAction::Show => {
            let engine_config = config::load(config_path)?;
            if config_path.exists() {
                println!("{}", format!("# {}", config_path.display()).dimmed());
            } else {
                println!("{}", "# defaults (no config file)".dimmed());
            }
            print!("{}", config::to_toml(&engine_config)?);
            Ok(())
        }
        ConfigAction::Validate { path } => {
            let path = path.as_deref().unwrap_or(config_path);
            if !path.exists() {
                return Err(CliError::ConfigNotFound(path.display().to_string()).into());
            }
            config::load(path)?;
            println!("{} {}", "✓".green(), path.display());
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
    }
}
