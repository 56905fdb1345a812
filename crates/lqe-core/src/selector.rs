//! Adaptive Strategy Selector
//!
//! Picks an execution strategy for a classified query from the cache and the
//! dependency graph. Candidates are evaluated in a fixed order and the first
//! applicable one wins:
//!
//! 1. `Cache`: a live entry whose confidence is above the cache floor
//! 2. `Parallel`: trusted graph data, positive parallel benefit, more than one layer
//! 3. `Distributed`: more layers than the fan-out threshold
//! 4. `Sequential`: everything else
//!
//! Selection reads shared state but never mutates it and never spawns work,
//! so identical cache/graph state and input always yield the same decision.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::cache::{CacheKey, CrossLayerCache};
use crate::config::SelectorConfig;
use crate::graph::{DependencyGraph, PatternRecommendation, Recommendation};
use crate::scoring::{clamp_unit, weighted_score};
use crate::telemetry::Calibration;
use crate::types::{QueryAnalysis, Strategy, StrategyDecision};

/// Share of the gap to full confidence a penalty recovers per recalibration
/// without fresh evidence
const CALIBRATION_RECOVERY: f64 = 0.25;

/// Multipliers this close to 1 are dropped
const CALIBRATION_NEUTRAL_EPSILON: f64 = 1e-3;

pub struct StrategySelector {
    config: SelectorConfig,
    graph: Arc<DependencyGraph>,
    cache: Arc<CrossLayerCache>,
    /// Workers a distributed wave can use; follows the pool's live target
    pool_capacity: AtomicUsize,
    calibration: RwLock<HashMap<(String, Strategy), f64>>,
}

impl StrategySelector {
    pub fn new(
        config: SelectorConfig,
        graph: Arc<DependencyGraph>,
        cache: Arc<CrossLayerCache>,
        pool_capacity: usize,
    ) -> Self {
        Self {
            config,
            graph,
            cache,
            pool_capacity: AtomicUsize::new(pool_capacity.max(1)),
            calibration: RwLock::new(HashMap::new()),
        }
    }

    /// Update the worker count distributed estimates assume
    pub fn set_pool_capacity(&self, workers: usize) {
        self.pool_capacity.store(workers.max(1), Ordering::Release);
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity.load(Ordering::Acquire)
    }

    /// Decide how to execute `analysis`
    pub fn select(&self, query_id: impl Into<String>, analysis: &QueryAnalysis) -> StrategyDecision {
        let query_type = analysis.query_type.as_str();
        let layers = &analysis.required_layers;
        let cache_key = CacheKey::fingerprint(query_type, layers, &analysis.params);
        let recommendation = self.graph.recommend(query_type);
        let mut reasoning = Vec::new();

        let (strategy, confidence, estimated_latency_ms) = self
            .consider_cache(analysis, &cache_key, &mut reasoning)
            .or_else(|| self.consider_parallel(analysis, &recommendation, &mut reasoning))
            .or_else(|| self.consider_distributed(analysis, &recommendation, &mut reasoning))
            .unwrap_or_else(|| self.sequential(analysis, &recommendation, &mut reasoning));

        debug!(
            query_type = %query_type,
            strategy = %strategy,
            confidence,
            estimated_latency_ms,
            "Selected strategy"
        );

        StrategyDecision {
            query_id: query_id.into(),
            strategy,
            confidence,
            reasoning,
            estimated_latency_ms,
            fallback_strategy: strategy.fallback(),
            cache_key: cache_key.to_string(),
        }
    }

    fn consider_cache(
        &self,
        analysis: &QueryAnalysis,
        key: &CacheKey,
        reasoning: &mut Vec<String>,
    ) -> Option<(Strategy, f64, f64)> {
        if !analysis.cacheable {
            reasoning.push("query marked not cacheable".to_string());
            return None;
        }

        let floor = self.config.cache_confidence_floor;
        match self.cache.peek_confidence(key) {
            Some(confidence) if confidence > floor => {
                reasoning.push(format!(
                    "cache entry confidence {:.3} above floor {:.3}",
                    confidence, floor
                ));
                Some((Strategy::Cache, confidence, self.config.cache_lookup_ms))
            }
            Some(confidence) => {
                reasoning.push(format!(
                    "cache entry confidence {:.3} not above floor {:.3}",
                    confidence, floor
                ));
                None
            }
            None => {
                reasoning.push("no live cache entry".to_string());
                None
            }
        }
    }

    fn consider_parallel(
        &self,
        analysis: &QueryAnalysis,
        recommendation: &Recommendation,
        reasoning: &mut Vec<String>,
    ) -> Option<(Strategy, f64, f64)> {
        let rec = match recommendation {
            Recommendation::InsufficientData {
                observed, required, ..
            } => {
                reasoning.push(format!(
                    "insufficient data for '{}': {} of {} samples",
                    analysis.query_type, observed, required
                ));
                return None;
            }
            Recommendation::Ready(rec) => rec,
        };

        if analysis.required_layers.len() < 2 {
            reasoning.push("single layer, nothing to parallelize".to_string());
            return None;
        }
        if rec.parallel_benefit_score <= 0.0 {
            reasoning.push(format!(
                "parallel benefit {:.3} is not positive",
                rec.parallel_benefit_score
            ));
            return None;
        }

        let base = weighted_score(&[
            (rec.parallel_benefit_score, 2.0),
            (self.sufficiency(rec.samples), 1.0),
        ]);
        let confidence = self.calibrated(&analysis.query_type, Strategy::Parallel, base, reasoning);
        let floor = self.config.parallel_confidence_floor;
        if confidence < floor {
            reasoning.push(format!(
                "parallel confidence {:.3} below floor {:.3}",
                confidence, floor
            ));
            return None;
        }

        let slowest = self.slowest_layer(analysis, Some(rec));
        reasoning.push(format!(
            "parallel benefit {:.3} over {} samples",
            rec.parallel_benefit_score, rec.samples
        ));
        Some((
            Strategy::Parallel,
            confidence,
            slowest + self.config.parallel_overhead_ms,
        ))
    }

    fn consider_distributed(
        &self,
        analysis: &QueryAnalysis,
        recommendation: &Recommendation,
        reasoning: &mut Vec<String>,
    ) -> Option<(Strategy, f64, f64)> {
        let layer_count = analysis.required_layers.len();
        if layer_count <= self.config.fanout_threshold {
            return None;
        }

        let rec = recommendation.ready();
        let sufficiency = match rec {
            Some(rec) => self.sufficiency(rec.samples),
            None => 0.0,
        };
        let base = weighted_score(&[(1.0, 1.0), (sufficiency, 1.0)]);
        let confidence = self.calibrated(&analysis.query_type, Strategy::Distributed, base, reasoning);
        let floor = self.config.distributed_confidence_floor;
        if confidence < floor {
            reasoning.push(format!(
                "distributed confidence {:.3} below floor {:.3}",
                confidence, floor
            ));
            return None;
        }

        let capacity = self.pool_capacity();
        let waves = layer_count.div_ceil(capacity);
        let per_layer = self.slowest_layer(analysis, rec);
        reasoning.push(format!(
            "{} layers exceed fan-out threshold {}, {} wave(s) of {}",
            layer_count, self.config.fanout_threshold, waves, capacity
        ));
        Some((Strategy::Distributed, confidence, per_layer * waves as f64))
    }

    fn sequential(
        &self,
        analysis: &QueryAnalysis,
        recommendation: &Recommendation,
        reasoning: &mut Vec<String>,
    ) -> (Strategy, f64, f64) {
        let rec = recommendation.ready();
        let samples = match recommendation {
            Recommendation::Ready(rec) => rec.samples,
            Recommendation::InsufficientData { observed, .. } => *observed,
        };
        let confidence = weighted_score(&[(1.0, 1.0), (self.sufficiency(samples), 1.0)]);
        let estimate: f64 = analysis
            .required_layers
            .iter()
            .map(|layer| self.layer_latency(rec, layer))
            .sum();

        if rec.is_none() {
            reasoning.push(format!(
                "falling back to sequential at {:.0}ms per layer",
                self.config.default_layer_latency_ms
            ));
        } else {
            reasoning.push("sequential using learned layer latencies".to_string());
        }
        (Strategy::Sequential, confidence, estimate)
    }

    /// Share of "well trusted" sample volume reached, twice the graph minimum
    fn sufficiency(&self, samples: u64) -> f64 {
        let full = (self.graph.min_samples() * 2).max(1) as f64;
        clamp_unit(samples as f64 / full)
    }

    fn layer_latency(&self, rec: Option<&PatternRecommendation>, layer: &str) -> f64 {
        rec.and_then(|r| r.layer_latencies.get(layer).copied())
            .unwrap_or(self.config.default_layer_latency_ms)
    }

    fn slowest_layer(&self, analysis: &QueryAnalysis, rec: Option<&PatternRecommendation>) -> f64 {
        analysis
            .required_layers
            .iter()
            .map(|layer| self.layer_latency(rec, layer))
            .fold(0.0, f64::max)
    }

    fn calibrated(&self, query_type: &str, strategy: Strategy, base: f64, reasoning: &mut Vec<String>) -> f64 {
        let multiplier = self.calibration_multiplier(query_type, strategy);
        if multiplier < 1.0 {
            reasoning.push(format!(
                "{} confidence scaled by calibration {:.3}",
                strategy, multiplier
            ));
        }
        clamp_unit(base * multiplier)
    }

    /// Current confidence multiplier for a (query type, strategy) pair
    pub fn calibration_multiplier(&self, query_type: &str, strategy: Strategy) -> f64 {
        self.calibration
            .read()
            .get(&(query_type.to_string(), strategy))
            .copied()
            .unwrap_or(1.0)
    }

    /// Fold telemetry corrections into the confidence multipliers
    ///
    /// Pairs with fresh evidence are set from it: success rate, further scaled
    /// down by the latency bias when actual latency overran the estimate.
    /// Penalized pairs without fresh evidence drift back toward 1 so the
    /// strategy is eventually retried.
    pub fn recalibrate(&self, calibrations: &[Calibration]) {
        let mut table = self.calibration.write();
        let mut touched = HashSet::new();

        for calibration in calibrations {
            if calibration.strategy == Strategy::Cache {
                continue;
            }
            let penalty = if calibration.underestimated {
                1.0 / calibration.latency_bias
            } else {
                1.0
            };
            let multiplier = clamp_unit(calibration.success_rate * penalty);
            let key = (calibration.query_type.clone(), calibration.strategy);

            if multiplier < 1.0 {
                info!(
                    query_type = %calibration.query_type,
                    strategy = %calibration.strategy,
                    multiplier,
                    latency_bias = calibration.latency_bias,
                    "Recalibrated strategy confidence"
                );
            }
            table.insert(key.clone(), multiplier);
            touched.insert(key);
        }

        for (key, multiplier) in table.iter_mut() {
            if !touched.contains(key) {
                *multiplier += CALIBRATION_RECOVERY * (1.0 - *multiplier);
            }
        }
        table.retain(|_, multiplier| *multiplier < 1.0 - CALIBRATION_NEUTRAL_EPSILON);
    }

    /// Every non-neutral multiplier, sorted
    pub fn calibration_snapshot(&self) -> Vec<(String, Strategy, f64)> {
        let mut entries: Vec<(String, Strategy, f64)> = self
            .calibration
            .read()
            .iter()
            .map(|((qt, strategy), m)| (qt.clone(), *strategy, *m))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        entries
    }
}
