//! Configuration file resolution for lqe.
//!
//! The config file is located with precedence:
//! 1. `--config <path>`
//! 2. `LQE_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/lqe/config.toml` on Linux)
//!
//! A missing file means defaults; a present but invalid file is an error.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use lqe_core::EngineConfig;
use std::path::{Path, PathBuf};

/// Resolve the config file path
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("LQE_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.toml")
}

fn default_config_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "lqe", "lqe") {
        proj_dirs.config_dir().to_path_buf()
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lqe")
    }
}

/// Load the engine configuration, falling back to defaults when no file exists
pub fn load(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(EngineConfig::default());
    }

    let config = EngineConfig::load(path)
        .with_context(|| format!("Failed to load config file {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded engine config");
    Ok(config)
}

/// Render a configuration as TOML
pub fn to_toml(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_path_wins() {
        let path = config_path(Some(Path::new("/tmp/custom.toml")));
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.pool.max_workers, EngineConfig::default().pool.max_workers);
    }

    #[test]
    fn test_partial_file_overrides_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmin_workers = 1\nmax_workers = 3").unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.max_workers, 3);
        assert_eq!(config.cache.max_entries, EngineConfig::default().cache.max_entries);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmin_workers = 0").unwrap();

        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to load config file"));
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let rendered = to_toml(&EngineConfig::default()).unwrap();
        let parsed = EngineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.selector.fanout_threshold, EngineConfig::default().selector.fanout_threshold);
    }
}
