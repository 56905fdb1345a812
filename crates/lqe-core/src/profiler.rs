//! Performance Profiler
//!
//! Append-only sink for [`QueryMetrics`]. Every other component that needs
//! historical latency reads it from here or from the dependency graph that
//! consumes the same samples.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

use crate::config::ProfilerConfig;
use crate::types::QueryMetrics;

/// Summary of every retained sample for one query type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub query_type: String,
    pub count: usize,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub success_rate: f64,
    pub mean_memory_mb: f64,
}

/// Per-layer call statistics across all query types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub layer: String,
    pub calls: usize,
    pub mean_latency_ms: f64,
}

/// Bounded in-memory store of query samples
pub struct PerformanceProfiler {
    samples: Mutex<VecDeque<QueryMetrics>>,
    max_samples: usize,
}

impl PerformanceProfiler {
    pub fn new(config: &ProfilerConfig) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            max_samples: config.max_samples.max(1),
        }
    }

    /// Record a sample. Never rejects; drops the oldest when full.
    pub fn record(&self, metrics: QueryMetrics) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(metrics);
    }

    /// Statistics for a query type, or `None` if it was never observed
    pub fn stats_for(&self, query_type: &str) -> Option<QueryStats> {
        let samples = self.samples.lock();
        let matching: Vec<&QueryMetrics> = samples
            .iter()
            .filter(|m| m.query_type == query_type)
            .collect();

        if matching.is_empty() {
            return None;
        }

        let count = matching.len();
        let mut latencies: Vec<f64> = matching.iter().map(|m| m.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean_latency_ms = latencies.iter().sum::<f64>() / count as f64;
        let cache_hits = matching.iter().filter(|m| m.cache_hit).count();
        let successes = matching.iter().filter(|m| m.success).count();
        let mean_memory_mb = matching.iter().map(|m| m.memory_mb).sum::<f64>() / count as f64;

        Some(QueryStats {
            query_type: query_type.to_string(),
            count,
            mean_latency_ms,
            p50_latency_ms: percentile(&latencies, 50.0),
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            min_latency_ms: latencies[0],
            max_latency_ms: latencies[count - 1],
            cache_hit_rate: cache_hits as f64 / count as f64,
            success_rate: successes as f64 / count as f64,
            mean_memory_mb,
        })
    }

    /// Latency statistics for one layer, or `None` if it was never queried
    pub fn layer_stats(&self, layer: &str) -> Option<LayerStats> {
        let samples = self.samples.lock();
        let latencies: Vec<f64> = samples
            .iter()
            .filter_map(|m| m.layer_latencies.get(layer).copied())
            .collect();

        if latencies.is_empty() {
            return None;
        }

        Some(LayerStats {
            layer: layer.to_string(),
            calls: latencies.len(),
            mean_latency_ms: latencies.iter().sum::<f64>() / latencies.len() as f64,
        })
    }

    /// Query types with at least one retained sample, sorted
    pub fn query_types(&self) -> Vec<String> {
        let samples = self.samples.lock();
        let types: BTreeSet<&str> = samples.iter().map(|m| m.query_type.as_str()).collect();
        types.into_iter().map(String::from).collect()
    }

    /// Copy of every retained sample, oldest first
    pub fn snapshot(&self) -> Vec<QueryMetrics> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Nearest-rank percentile over sorted values
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
