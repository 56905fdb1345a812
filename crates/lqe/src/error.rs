//! Error types for lqe.

use thiserror::Error;

/// Errors raised by the CLI before the engine is involved.
#[derive(Error, Debug, PartialEq)]
pub enum CliError {
    #[error("Invalid argument --{flag}: {reason}")]
    InvalidArgument { flag: &'static str, reason: String },

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),
}

impl CliError {
    pub fn invalid_argument(flag: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            flag,
            reason: reason.into(),
        }
    }
}
