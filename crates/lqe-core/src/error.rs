//! Engine Error Types
//!
//! Hard errors only: construction-time misconfiguration and contract
//! violations. Per-task failures are data (see [`crate::types::TaskError`]).

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A config section failed validation
    #[error("invalid engine config: {0}")]
    Config(#[from] crate::config::ConfigValidationError),

    /// Work submitted after the pool was shut down
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// Call made in a state where it cannot succeed, e.g. outside a runtime
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("config file unreadable: {0}")]
    Io(#[from] std::io::Error),

    /// Result could not be encoded, e.g. for canonical output
    #[error("result encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config file malformed: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// True when the pool no longer accepts work
    pub fn is_pool_shutdown(&self) -> bool {
        matches!(self, Self::PoolShutdown)
    }

    /// True for errors caused by configuration rather than runtime state
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ConfigParse(_) | Self::Io(_))
    }
}
