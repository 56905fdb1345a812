//! Engine Configuration
//!
//! Defines the tunable thresholds for every component of the engine.
//! All sections deserialize from TOML with per-field defaults, so a config
//! file only needs to name the values it overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::EngineResult;

/// Engine configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dependency graph configuration
    pub graph: GraphConfig,

    /// Cross-layer cache configuration
    pub cache: CacheConfig,

    /// Worker pool configuration
    pub pool: PoolConfig,

    /// Strategy selector configuration
    pub selector: SelectorConfig,

    /// Execution telemetry configuration
    pub telemetry: TelemetryConfig,

    /// Result aggregator configuration
    pub aggregator: AggregatorConfig,

    /// Performance profiler configuration
    pub profiler: ProfilerConfig,
}

/// Dependency graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Observations required before a query pattern is trusted (default: 3)
    pub min_samples: usize,

    /// Weight of the newest sample in exponential latency averages (default: 0.2)
    pub latency_smoothing: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            latency_smoothing: 0.2,
        }
    }
}

/// Cross-layer cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached aggregates (default: 1000)
    pub max_entries: usize,

    /// TTL applied when the caller does not pass one (default: 300 = 5 minutes)
    pub default_ttl_seconds: u64,

    /// Confidence assigned to freshly inserted entries (default: 0.95)
    pub insert_confidence: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl_seconds: 300, // 5 minutes
            insert_confidence: 0.95,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Lower bound on live workers (default: 2)
    pub min_workers: usize,

    /// Upper bound on live workers (default: 8)
    pub max_workers: usize,

    /// Throughput the load balancer sizes the pool for (default: 50.0)
    pub target_qps: f64,

    /// Sliding window for observed throughput in seconds (default: 10)
    pub qps_window_secs: u64,

    /// Load balancer cadence in milliseconds (default: 1000)
    pub rebalance_interval_ms: u64,

    /// Grow when observed qps exceeds target * ratio (default: 0.8)
    pub scale_up_ratio: f64,

    /// Shrink when observed qps drops below target * ratio (default: 0.3)
    pub scale_down_ratio: f64,

    /// Hard ceiling after which an unresponsive task is force-failed (default: 60000)
    pub hard_ceiling_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            target_qps: 50.0,
            qps_window_secs: 10,
            rebalance_interval_ms: 1000,
            scale_up_ratio: 0.8,
            scale_down_ratio: 0.3,
            hard_ceiling_ms: 60_000,
        }
    }
}

/// Strategy selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Minimum cache confidence for a CACHE decision (default: 0.3)
    pub cache_confidence_floor: f64,

    /// Minimum calibrated confidence for a PARALLEL decision (default: 0.3)
    pub parallel_confidence_floor: f64,

    /// Minimum calibrated confidence for a DISTRIBUTED decision (default: 0.2)
    pub distributed_confidence_floor: f64,

    /// Layer count above which a query is fanned out in waves (default: 4)
    pub fanout_threshold: usize,

    /// Estimated cost of a cache lookup in milliseconds (default: 1.0)
    pub cache_lookup_ms: f64,

    /// Fixed coordination cost added to parallel estimates (default: 5.0)
    pub parallel_overhead_ms: f64,

    /// Per-layer latency assumed when nothing has been learned (default: 100.0)
    pub default_layer_latency_ms: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            cache_confidence_floor: 0.3,
            parallel_confidence_floor: 0.3,
            distributed_confidence_floor: 0.2,
            fanout_threshold: 4,
            cache_lookup_ms: 1.0,
            parallel_overhead_ms: 5.0,
            default_layer_latency_ms: 100.0,
        }
    }
}

/// Execution telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Days of telemetry to retain (default: 30)
    pub retention_days: u64,

    /// Recalibrate selector and graph every N executed queries (default: 20)
    pub recalibrate_every: usize,

    /// Samples per (query type, strategy) before a correction is derived (default: 5)
    pub min_calibration_samples: usize,

    /// Actual/estimated latency ratio tolerated before confidence is reduced (default: 1.5)
    pub underestimate_tolerance: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            recalibrate_every: 20,
            min_calibration_samples: 5,
            underestimate_tolerance: 1.5,
        }
    }
}

/// Result aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Trust weight for sources missing from `source_confidence` (default: 0.5)
    pub default_source_confidence: f64,

    /// Tie-break order when two sources have equal confidence
    pub source_priority: Vec<String>,

    /// Trust weight per source layer
    pub source_confidence: BTreeMap<String, f64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let mut source_confidence = BTreeMap::new();
        source_confidence.insert("semantic".to_string(), 0.8);
        source_confidence.insert("procedural".to_string(), 0.75);
        source_confidence.insert("graph".to_string(), 0.7);
        source_confidence.insert("episodic".to_string(), 0.6);

        Self {
            default_source_confidence: 0.5,
            source_priority: vec![
                "semantic".into(),
                "procedural".into(),
                "graph".into(),
                "episodic".into(),
            ],
            source_confidence,
        }
    }
}

/// Performance profiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Samples retained before the oldest are dropped (default: 10000)
    pub max_samples: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self { max_samples: 10_000 }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Set graph configuration
    pub fn with_graph(mut self, graph: GraphConfig) -> Self {
        self.graph = graph;
        self
    }

    /// Set cache configuration
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set pool configuration
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set selector configuration
    pub fn with_selector(mut self, selector: SelectorConfig) -> Self {
        self.selector = selector;
        self
    }

    /// Set telemetry configuration
    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Set aggregator configuration
    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.graph.min_samples == 0 {
            return Err(invalid("graph.min_samples", "must be greater than 0"));
        }
        check_unit("graph.latency_smoothing", self.graph.latency_smoothing)?;
        if self.graph.latency_smoothing == 0.0 {
            return Err(invalid("graph.latency_smoothing", "must be greater than 0"));
        }

        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "must be greater than 0"));
        }
        if self.cache.default_ttl_seconds == 0 {
            return Err(invalid("cache.default_ttl_seconds", "must be greater than 0"));
        }
        check_unit("cache.insert_confidence", self.cache.insert_confidence)?;

        self.pool.validate()?;

        check_unit("selector.cache_confidence_floor", self.selector.cache_confidence_floor)?;
        check_unit("selector.parallel_confidence_floor", self.selector.parallel_confidence_floor)?;
        check_unit(
            "selector.distributed_confidence_floor",
            self.selector.distributed_confidence_floor,
        )?;
        if self.selector.fanout_threshold < 2 {
            return Err(invalid("selector.fanout_threshold", "must be at least 2"));
        }
        if self.selector.default_layer_latency_ms <= 0.0 {
            return Err(invalid("selector.default_layer_latency_ms", "must be greater than 0"));
        }

        if self.telemetry.retention_days == 0 {
            return Err(invalid("telemetry.retention_days", "must be greater than 0"));
        }
        if self.telemetry.recalibrate_every == 0 {
            return Err(invalid("telemetry.recalibrate_every", "must be greater than 0"));
        }
        if self.telemetry.underestimate_tolerance < 1.0 {
            return Err(invalid("telemetry.underestimate_tolerance", "must be at least 1.0"));
        }

        check_unit(
            "aggregator.default_source_confidence",
            self.aggregator.default_source_confidence,
        )?;
        for (source, weight) in &self.aggregator.source_confidence {
            check_unit(&format!("aggregator.source_confidence.{}", source), *weight)?;
        }

        if self.profiler.max_samples == 0 {
            return Err(invalid("profiler.max_samples", "must be greater than 0"));
        }

        Ok(())
    }
}

impl PoolConfig {
    /// Validate pool sizing on its own (the pool can be built standalone)
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.min_workers == 0 {
            return Err(invalid("pool.min_workers", "must be greater than 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigValidationError::WorkerBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        if self.target_qps <= 0.0 {
            return Err(invalid("pool.target_qps", "must be greater than 0"));
        }
        if self.qps_window_secs == 0 {
            return Err(invalid("pool.qps_window_secs", "must be greater than 0"));
        }
        if self.scale_down_ratio >= self.scale_up_ratio {
            return Err(invalid(
                "pool.scale_down_ratio",
                "must be lower than pool.scale_up_ratio",
            ));
        }
        if self.hard_ceiling_ms == 0 {
            return Err(invalid("pool.hard_ceiling_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), ConfigValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, "must be between 0 and 1"))
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("min_workers ({min}) must not exceed max_workers ({max})")]
    WorkerBounds { min: usize, max: usize },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.graph.min_samples, 3);
        assert_eq!(config.cache.default_ttl_seconds, 300);
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.telemetry.retention_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::default()
            .with_graph(GraphConfig {
                min_samples: 10,
                ..Default::default()
            })
            .with_pool(PoolConfig {
                min_workers: 1,
                max_workers: 4,
                ..Default::default()
            });

        assert_eq!(config.graph.min_samples, 10);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.max_workers, 4);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.pool.min_workers = 9;
        config.pool.max_workers = 8;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::WorkerBounds { min: 9, max: 8 })
        ));

        let mut config = EngineConfig::default();
        config.cache.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.selector.parallel_confidence_floor = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.pool.scale_down_ratio = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [graph]
            min_samples = 5

            [pool]
            max_workers = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.graph.min_samples, 5);
        assert_eq!(config.pool.max_workers, 16);
        assert_eq!(config.pool.min_workers, 2);
        assert_eq!(config.cache.max_entries, 1000);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = EngineConfig::from_toml_str(
            r#"
            [pool]
            min_workers = 10
            max_workers = 2
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[telemetry]\nretention_days = 7").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.telemetry.retention_days, 7);
    }
}
