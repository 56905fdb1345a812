//! Layer Dependency Graph
//!
//! Learns, per query type, which layers are queried together, how long each
//! layer takes, and whether the query type is worth caching or fanning out.
//!
//! # Abstention
//!
//! Below `min_samples` observations for a query type, [`DependencyGraph::recommend`]
//! returns [`Recommendation::InsufficientData`]. It never extrapolates a score
//! from fewer samples.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::GraphConfig;
use crate::scoring::{latency_balance, saturating_ratio, weighted_score};
use crate::types::QueryMetrics;

/// Latency at which the latency component of cache-worthiness saturates
const CACHE_LATENCY_SATURATION_MS: f64 = 250.0;

/// Cache-worthiness at or above which a query type is worth caching
const CACHE_WORTHY_THRESHOLD: f64 = 0.5;

/// Bounds for telemetry-driven latency corrections
const MIN_LATENCY_CORRECTION: f64 = 0.5;
const MAX_LATENCY_CORRECTION: f64 = 4.0;

/// Learned relation between two layers for one query type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDependency {
    pub query_type: String,
    pub layer_a: String,
    pub layer_b: String,
    pub co_occurrences: u64,
    /// Share of this query type's samples that touched both layers
    pub correlation: f64,
    pub avg_joint_latency_ms: f64,
}

/// Aggregate view of one query type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPattern {
    pub query_type: String,
    pub typical_layers: Vec<String>,
    pub frequency: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub cache_worthiness: f64,
    pub parallel_benefit_score: f64,
}

/// Learned advice for a trusted query type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecommendation {
    pub query_type: String,
    pub samples: u64,
    pub is_cache_worthy: bool,
    pub cache_worthiness: f64,
    /// Signed in `[-1, 1]`; positive means fan-out is expected to pay off
    pub parallel_benefit_score: f64,
    pub typical_layers: Vec<String>,
    /// Learned per-layer latency with telemetry corrections applied
    pub layer_latencies: BTreeMap<String, f64>,
    pub avg_latency_ms: f64,
}

/// Result of [`DependencyGraph::recommend`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Recommendation {
    InsufficientData {
        query_type: String,
        observed: u64,
        required: u64,
    },
    Ready(PatternRecommendation),
}

impl Recommendation {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }

    pub fn ready(&self) -> Option<&PatternRecommendation> {
        match self {
            Self::Ready(rec) => Some(rec),
            Self::InsufficientData { .. } => None,
        }
    }
}

/// Running average: count-weighted until the smoothing window fills, then exponential
#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    count: u64,
    value: f64,
}

impl RunningMean {
    fn update(&mut self, sample: f64, smoothing: f64) {
        self.count += 1;
        let alpha = (1.0 / self.count as f64).max(smoothing);
        self.value += alpha * (sample - self.value);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LayerSetStats {
    count: u64,
    last_seen: u64,
}

#[derive(Debug, Default)]
struct PatternState {
    frequency: u64,
    successes: u64,
    latency: RunningMean,
    layer_latency: BTreeMap<String, RunningMean>,
    layer_sets: BTreeMap<Vec<String>, LayerSetStats>,
    latency_correction: Option<f64>,
}

#[derive(Debug, Default)]
struct EdgeState {
    co_occurrences: u64,
    joint_latency: RunningMean,
}

#[derive(Default)]
struct GraphState {
    /// Monotonic observation counter used for recency tie-breaks
    sequence: u64,
    patterns: HashMap<String, PatternState>,
    /// Keyed by (query type, lower layer, higher layer)
    edges: BTreeMap<(String, String, String), EdgeState>,
}

/// Learns layer co-occurrence and latency per query type
pub struct DependencyGraph {
    state: RwLock<GraphState>,
    config: GraphConfig,
}

impl DependencyGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            config,
        }
    }

    /// Fold one completed query into the graph
    pub fn observe(&self, metrics: &QueryMetrics) {
        let smoothing = self.config.latency_smoothing;
        let mut state = self.state.write();
        state.sequence += 1;
        let sequence = state.sequence;

        let mut layer_set = metrics.layers_queried.clone();
        layer_set.sort();
        layer_set.dedup();

        let pattern = state.patterns.entry(metrics.query_type.clone()).or_default();
        pattern.frequency += 1;
        if metrics.success {
            pattern.successes += 1;
        }
        pattern.latency.update(metrics.latency_ms, smoothing);

        for (layer, latency) in &metrics.layer_latencies {
            pattern
                .layer_latency
                .entry(layer.clone())
                .or_default()
                .update(*latency, smoothing);
        }

        let set_stats = pattern.layer_sets.entry(layer_set.clone()).or_default();
        set_stats.count += 1;
        set_stats.last_seen = sequence;

        for (i, a) in layer_set.iter().enumerate() {
            for b in &layer_set[i + 1..] {
                let joint = metrics.layer_latencies.get(a).copied().unwrap_or(0.0)
                    + metrics.layer_latencies.get(b).copied().unwrap_or(0.0);
                let edge = state
                    .edges
                    .entry((metrics.query_type.clone(), a.clone(), b.clone()))
                    .or_default();
                edge.co_occurrences += 1;
                edge.joint_latency.update(joint, smoothing);
            }
        }

        debug!(
            query_type = %metrics.query_type,
            layers = ?layer_set,
            "Observed query sample"
        );
    }

    /// Advice for a query type, or an explicit abstention below `min_samples`
    pub fn recommend(&self, query_type: &str) -> Recommendation {
        let state = self.state.read();
        let required = self.config.min_samples as u64;

        let pattern = match state.patterns.get(query_type) {
            Some(p) if p.frequency >= required => p,
            other => {
                return Recommendation::InsufficientData {
                    query_type: query_type.to_string(),
                    observed: other.map(|p| p.frequency).unwrap_or(0),
                    required,
                };
            }
        };

        let typical_layers = typical_layer_set(pattern);
        let correction = pattern.latency_correction.unwrap_or(1.0);
        let layer_latencies: BTreeMap<String, f64> = pattern
            .layer_latency
            .iter()
            .map(|(layer, mean)| (layer.clone(), mean.value * correction))
            .collect();

        let avg_latency_ms = pattern.latency.value * correction;
        let (cache_worthiness, parallel_benefit_score) =
            scores(pattern, avg_latency_ms, &typical_layers, &layer_latencies);

        Recommendation::Ready(PatternRecommendation {
            query_type: query_type.to_string(),
            samples: pattern.frequency,
            is_cache_worthy: cache_worthiness >= CACHE_WORTHY_THRESHOLD,
            cache_worthiness,
            parallel_benefit_score,
            typical_layers,
            layer_latencies,
            avg_latency_ms,
        })
    }

    /// Aggregate pattern for a query type, regardless of sample count
    pub fn pattern(&self, query_type: &str) -> Option<QueryPattern> {
        let state = self.state.read();
        let pattern = state.patterns.get(query_type)?;

        let typical_layers = typical_layer_set(pattern);
        let layer_latencies: BTreeMap<String, f64> = pattern
            .layer_latency
            .iter()
            .map(|(layer, mean)| (layer.clone(), mean.value))
            .collect();
        let (cache_worthiness, parallel_benefit_score) =
            scores(pattern, pattern.latency.value, &typical_layers, &layer_latencies);

        Some(QueryPattern {
            query_type: query_type.to_string(),
            typical_layers,
            frequency: pattern.frequency,
            avg_latency_ms: pattern.latency.value,
            success_rate: pattern.successes as f64 / pattern.frequency as f64,
            cache_worthiness,
            parallel_benefit_score,
        })
    }

    /// Learned layer pairs for a query type, strongest first
    pub fn dependencies(&self, query_type: &str) -> Vec<LayerDependency> {
        let state = self.state.read();
        let frequency = match state.patterns.get(query_type) {
            Some(p) => p.frequency,
            None => return Vec::new(),
        };

        let mut deps: Vec<LayerDependency> = state
            .edges
            .iter()
            .filter(|((qt, _, _), _)| qt == query_type)
            .map(|((qt, a, b), edge)| LayerDependency {
                query_type: qt.clone(),
                layer_a: a.clone(),
                layer_b: b.clone(),
                co_occurrences: edge.co_occurrences,
                correlation: (edge.co_occurrences as f64 / frequency as f64).min(1.0),
                avg_joint_latency_ms: edge.joint_latency.value,
            })
            .collect();

        deps.sort_by(|x, y| {
            y.co_occurrences
                .cmp(&x.co_occurrences)
                .then_with(|| x.layer_a.cmp(&y.layer_a))
                .then_with(|| x.layer_b.cmp(&y.layer_b))
        });
        deps
    }

    /// Learned latency for one layer of a query type, with corrections applied
    ///
    /// Returns `None` until the query type has `min_samples` observations.
    pub fn estimated_layer_latency(&self, query_type: &str, layer: &str) -> Option<f64> {
        let state = self.state.read();
        let pattern = state.patterns.get(query_type)?;
        if pattern.frequency < self.config.min_samples as u64 {
            return None;
        }
        let mean = pattern.layer_latency.get(layer)?;
        Some(mean.value * pattern.latency_correction.unwrap_or(1.0))
    }

    /// Scale future latency estimates for a query type by `factor`
    ///
    /// Fed by telemetry when actual latencies drift from estimates.
    pub fn apply_latency_correction(&self, query_type: &str, factor: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let factor = factor.clamp(MIN_LATENCY_CORRECTION, MAX_LATENCY_CORRECTION);
        let mut state = self.state.write();
        if let Some(pattern) = state.patterns.get_mut(query_type) {
            pattern.latency_correction = Some(factor);
            debug!(query_type = %query_type, factor, "Applied latency correction");
        }
    }

    /// Correction currently applied to a query type's latency estimates
    pub fn latency_correction(&self, query_type: &str) -> f64 {
        self.state
            .read()
            .patterns
            .get(query_type)
            .and_then(|p| p.latency_correction)
            .unwrap_or(1.0)
    }

    /// Observations recorded for a query type
    pub fn sample_count(&self, query_type: &str) -> u64 {
        self.state
            .read()
            .patterns
            .get(query_type)
            .map(|p| p.frequency)
            .unwrap_or(0)
    }

    pub fn min_samples(&self) -> usize {
        self.config.min_samples
    }
}

/// Most frequent layer set; ties go to the most recently observed
fn typical_layer_set(pattern: &PatternState) -> Vec<String> {
    pattern
        .layer_sets
        .iter()
        .max_by(|(_, a), (_, b)| a.count.cmp(&b.count).then(a.last_seen.cmp(&b.last_seen)))
        .map(|(set, _)| set.clone())
        .unwrap_or_default()
}

/// (cache-worthiness, parallel-benefit) for a pattern whose average latency is `avg_latency_ms`
fn scores(
    pattern: &PatternState,
    avg_latency_ms: f64,
    typical_layers: &[String],
    layer_latencies: &BTreeMap<String, f64>,
) -> (f64, f64) {
    let repeat_share = pattern
        .layer_sets
        .get(typical_layers)
        .map(|s| s.count as f64 / pattern.frequency.max(1) as f64)
        .unwrap_or(0.0);
    let latency_component = saturating_ratio(avg_latency_ms, CACHE_LATENCY_SATURATION_MS);
    let cache_worthiness = weighted_score(&[(latency_component, 2.0), (repeat_share, 1.0)]);

    let latencies: Vec<f64> = typical_layers
        .iter()
        .filter_map(|layer| layer_latencies.get(layer).copied())
        .collect();
    let parallel_benefit = if latencies.len() > 1 {
        2.0 * latency_balance(&latencies) - 1.0
    } else {
        -1.0
    };

    (cache_worthiness, parallel_benefit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(min_samples: usize) -> DependencyGraph {
        DependencyGraph::new(GraphConfig {
            min_samples,
            ..Default::default()
        })
    }

    fn sample(query_type: &str, layers: &[(&str, f64)]) -> QueryMetrics {
        QueryMetrics::new(
            uuid::Uuid::new_v4().to_string(),
            query_type,
            layers.iter().map(|(l, ms)| (l.to_string(), *ms)),
        )
    }

    #[test]
    fn test_insufficient_data_below_min_samples() {
        let graph = graph(3);
        assert_eq!(
            graph.recommend("temporal"),
            Recommendation::InsufficientData {
                query_type: "temporal".into(),
                observed: 0,
                required: 3,
            }
        );

        graph.observe(&sample("temporal", &[("episodic", 80.0), ("semantic", 70.0)]));
        graph.observe(&sample("temporal", &[("episodic", 80.0), ("semantic", 70.0)]));

        let rec = graph.recommend("temporal");
        assert!(rec.is_insufficient());
        assert!(rec.ready().is_none());
        assert!(graph.estimated_layer_latency("temporal", "episodic").is_none());
    }

    #[test]
    fn test_comparable_latencies_benefit_from_parallel() {
        let graph = graph(3);
        for (e, s) in [(80.0, 70.0), (82.0, 69.0), (79.0, 71.0), (81.0, 70.0), (78.0, 72.0)] {
            graph.observe(&sample("temporal", &[("episodic", e), ("semantic", s)]));
        }

        let rec = graph.recommend("temporal");
        let rec = rec.ready().unwrap();
        assert_eq!(rec.samples, 5);
        assert!(rec.parallel_benefit_score > 0.0);
        assert_eq!(rec.typical_layers, vec!["episodic", "semantic"]);

        let episodic = graph.estimated_layer_latency("temporal", "episodic").unwrap();
        assert!((episodic - 80.0).abs() < 3.0);
    }

    #[test]
    fn test_dominant_layer_has_negative_benefit() {
        let graph = graph(2);
        for _ in 0..4 {
            graph.observe(&sample("lookup", &[("graph", 600.0), ("semantic", 5.0)]));
        }

        let rec = graph.recommend("lookup");
        assert!(rec.ready().unwrap().parallel_benefit_score < 0.0);
    }

    #[test]
    fn test_single_layer_never_benefits() {
        let graph = graph(1);
        graph.observe(&sample("factual", &[("semantic", 50.0)]));
        assert_eq!(
            graph.recommend("factual").ready().unwrap().parallel_benefit_score,
            -1.0
        );
    }

    #[test]
    fn test_typical_layers_tie_prefers_most_recent() {
        let graph = graph(1);
        graph.observe(&sample("mixed", &[("episodic", 10.0)]));
        graph.observe(&sample("mixed", &[("semantic", 10.0)]));

        let rec = graph.recommend("mixed");
        assert_eq!(rec.ready().unwrap().typical_layers, vec!["semantic"]);

        graph.observe(&sample("mixed", &[("episodic", 10.0)]));
        let rec = graph.recommend("mixed");
        assert_eq!(rec.ready().unwrap().typical_layers, vec!["episodic"]);
    }

    #[test]
    fn test_cache_worthiness_rises_with_latency() {
        let graph = graph(2);
        for _ in 0..3 {
            graph.observe(&sample("slow", &[("graph", 400.0)]).with_latency(400.0));
            graph.observe(&sample("fast", &[("graph", 2.0)]).with_latency(2.0));
        }

        let slow = graph.recommend("slow");
        let fast = graph.recommend("fast");
        let slow = slow.ready().unwrap();
        let fast = fast.ready().unwrap();
        assert!(slow.cache_worthiness > fast.cache_worthiness);
        assert!(slow.is_cache_worthy);
        assert!(!fast.is_cache_worthy);
    }

    #[test]
    fn test_dependencies() {
        let graph = graph(1);
        graph.observe(&sample("temporal", &[("episodic", 80.0), ("semantic", 70.0)]));
        graph.observe(&sample("temporal", &[("semantic", 70.0), ("episodic", 80.0)]));
        graph.observe(&sample("temporal", &[("episodic", 80.0), ("graph", 20.0)]));

        let deps = graph.dependencies("temporal");
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].layer_a, "episodic");
        assert_eq!(deps[0].layer_b, "semantic");
        assert_eq!(deps[0].co_occurrences, 2);
        assert!((deps[0].correlation - 2.0 / 3.0).abs() < 1e-9);
        assert!((deps[0].avg_joint_latency_ms - 150.0).abs() < 1e-9);

        assert!(graph.dependencies("unknown").is_empty());
    }

    #[test]
    fn test_latency_correction() {
        let graph = graph(1);
        graph.observe(&sample("temporal", &[("episodic", 100.0)]));

        graph.apply_latency_correction("temporal", 2.0);
        assert_eq!(graph.estimated_layer_latency("temporal", "episodic"), Some(200.0));

        // Clamped
        graph.apply_latency_correction("temporal", 100.0);
        assert_eq!(graph.estimated_layer_latency("temporal", "episodic"), Some(400.0));
    }

    #[test]
    fn test_latency_correction_feeds_cache_worthiness() {
        let graph = graph(2);
        for _ in 0..3 {
            graph.observe(&sample("recall", &[("episodic", 40.0)]).with_latency(40.0));
        }
        let before = graph.recommend("recall").ready().unwrap().clone();
        assert!(!before.is_cache_worthy);

        // Actual latencies ran four times the learned ones
        graph.apply_latency_correction("recall", 4.0);
        let after = graph.recommend("recall").ready().unwrap().clone();
        assert!(after.cache_worthiness > before.cache_worthiness);
        assert!(after.is_cache_worthy);
        assert!((after.avg_latency_ms - 160.0).abs() < 1e-9);

        // The raw pattern view stays uncorrected
        let pattern = graph.pattern("recall").unwrap();
        assert!((pattern.cache_worthiness - before.cache_worthiness).abs() < 1e-9);
    }
}
