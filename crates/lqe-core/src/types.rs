//! Core Type Definitions
//!
//! Data records shared between the profiler, graph, selector, pool,
//! aggregator and telemetry collector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Strategy
// ─────────────────────────────────────────────────────────────────────────────

/// Execution plan chosen for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Cache,
    Sequential,
    Parallel,
    Distributed,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Cache,
        Strategy::Sequential,
        Strategy::Parallel,
        Strategy::Distributed,
    ];

    /// The next more conservative strategy
    pub fn fallback(&self) -> Strategy {
        match self {
            Self::Cache => Self::Sequential,
            Self::Sequential => Self::Sequential,
            Self::Parallel => Self::Sequential,
            Self::Distributed => Self::Parallel,
        }
    }

    /// Convert from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cache" => Some(Self::Cache),
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            "distributed" => Some(Self::Distributed),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Profiler samples
// ─────────────────────────────────────────────────────────────────────────────

/// One completed query's observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub query_id: String,
    /// Opaque to the engine
    pub query_text: String,
    pub query_type: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub memory_mb: f64,
    pub cache_hit: bool,
    pub result_count: usize,
    /// Ordered, duplicate-free
    pub layers_queried: Vec<String>,
    pub layer_latencies: BTreeMap<String, f64>,
    pub success: bool,
}

impl QueryMetrics {
    /// Create a successful sample with per-layer latencies
    pub fn new(
        query_id: impl Into<String>,
        query_type: impl Into<String>,
        layer_latencies: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        let mut layers_queried = Vec::new();
        let mut latencies = BTreeMap::new();
        for (layer, ms) in layer_latencies {
            if !layers_queried.contains(&layer) {
                layers_queried.push(layer.clone());
            }
            latencies.insert(layer, ms);
        }
        let latency_ms = latencies.values().cloned().fold(0.0, f64::max);

        Self {
            query_id: query_id.into(),
            query_text: String::new(),
            query_type: query_type.into(),
            timestamp: Utc::now(),
            latency_ms,
            memory_mb: 0.0,
            cache_hit: false,
            result_count: 0,
            layers_queried,
            layer_latencies: latencies,
            success: true,
        }
    }

    /// Set the total latency
    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query analysis and decisions
// ─────────────────────────────────────────────────────────────────────────────

/// A classified query as delivered by the external classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub query_type: String,
    pub required_layers: Vec<String>,
    /// Classifier hint; `false` keeps the result out of the cache
    pub cacheable: bool,
    /// Parameters that change the result and therefore the cache key
    pub params: BTreeMap<String, String>,
}

impl QueryAnalysis {
    pub fn new<I, S>(query_type: impl Into<String>, required_layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut layers: Vec<String> = Vec::new();
        for layer in required_layers {
            let layer = layer.into();
            if !layers.contains(&layer) {
                layers.push(layer);
            }
        }

        Self {
            query_type: query_type.into(),
            required_layers: layers,
            cacheable: true,
            params: BTreeMap::new(),
        }
    }

    /// Add a cache-relevant parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// The selector's verdict for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub query_id: String,
    pub strategy: Strategy,
    pub confidence: f64,
    pub reasoning: Vec<String>,
    pub estimated_latency_ms: f64,
    pub fallback_strategy: Strategy,
    /// Fingerprint the decision was made against
    pub cache_key: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Dispatch priority; higher runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// A single layer call dispatched to the worker pool
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub task_id: String,
    pub layer_name: String,
    /// Resolved through the pool's query function registry
    pub query_fn_name: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub timeout: Duration,
    pub priority: TaskPriority,
}

impl WorkerTask {
    pub fn new(layer_name: impl Into<String>, query_fn_name: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            layer_name: layer_name.into(),
            query_fn_name: query_fn_name.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            timeout: Duration::from_secs(30),
            priority: TaskPriority::default(),
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_arg(mut self, arg: serde_json::Value) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Why a task produced no payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TaskError {
    #[error("layer call failed: {0}")]
    Failed(String),

    #[error("timed out after {0}ms")]
    TimedOut(u64),

    #[error("cancelled before completion")]
    Cancelled,

    #[error("layer call panicked: {0}")]
    Panicked(String),

    #[error("unknown query function: {0}")]
    UnknownQueryFunction(String),

    #[error("force-failed after hard ceiling of {0}ms")]
    ForceFailed(u64),
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::ForceFailed(_))
    }
}

/// Outcome of one worker task
#[derive(Debug, Clone)]
pub struct WorkerTaskResult {
    pub task_id: String,
    pub layer_name: String,
    pub outcome: Result<LayerPayload, TaskError>,
    pub latency_ms: f64,
}

impl WorkerTaskResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }

    pub(crate) fn failed(task: &WorkerTask, error: TaskError, latency_ms: f64) -> Self {
        Self {
            task_id: task.task_id.clone(),
            layer_name: task.layer_name.clone(),
            outcome: Err(error),
            latency_ms,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Layer results
// ─────────────────────────────────────────────────────────────────────────────

/// One record returned by a layer, keyed by a stable identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Identity used to deduplicate across layers
    pub id: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl LayerRecord {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
            score: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Raw result of a single layer call
pub type LayerPayload = Vec<LayerRecord>;

/// Trust weight for a source during aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfidence {
    pub source: String,
    pub weight: f64,
}

impl SourceConfidence {
    pub fn new(source: impl Into<String>, weight: f64) -> Self {
        Self {
            source: source.into(),
            weight: weight.clamp(0.0, 1.0),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Predicted versus actual outcome of one executed query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTelemetry {
    pub query_id: String,
    pub query_type: String,
    pub strategy_chosen: Strategy,
    pub strategy_confidence: f64,
    pub estimated_latency_ms: f64,
    /// Whether the estimate came from learned graph data rather than defaults
    #[serde(default)]
    pub learned_estimate: bool,
    pub total_latency_ms: f64,
    pub success: bool,
    pub layers_queried: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_fallbacks() {
        assert_eq!(Strategy::Cache.fallback(), Strategy::Sequential);
        assert_eq!(Strategy::Parallel.fallback(), Strategy::Sequential);
        assert_eq!(Strategy::Distributed.fallback(), Strategy::Parallel);
        assert_eq!(Strategy::Sequential.fallback(), Strategy::Sequential);
    }

    #[test]
    fn test_strategy_string_roundtrip() {
        for strategy in Strategy::ALL {
            assert_eq!(Strategy::from_str(strategy.as_str()), Some(strategy));
        }
        assert_eq!(Strategy::from_str("PARALLEL"), Some(Strategy::Parallel));
        assert_eq!(Strategy::from_str("bogus"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn test_analysis_dedupes_layers() {
        let analysis = QueryAnalysis::new("temporal", ["episodic", "semantic", "episodic"]);
        assert_eq!(analysis.required_layers, vec!["episodic", "semantic"]);
        assert!(analysis.cacheable);
    }

    #[test]
    fn test_metrics_latency_defaults_to_slowest_layer() {
        let metrics = QueryMetrics::new(
            "q1",
            "temporal",
            vec![("episodic".to_string(), 80.0), ("semantic".to_string(), 70.0)],
        );
        assert_eq!(metrics.latency_ms, 80.0);
        assert_eq!(metrics.layers_queried, vec!["episodic", "semantic"]);
    }
}
