//! Execution Telemetry Collector
//!
//! Records predicted versus actual outcomes per executed query and turns them
//! into corrections: latency bias per query type (fed to the dependency
//! graph) and confidence multipliers per strategy (fed to the selector).
//!
//! Entries older than `retention_days` are pruned on write and by
//! [`TelemetryCollector::prune_expired`].

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::scoring::{clamp_unit, estimate_accuracy};
use crate::types::{ExecutionTelemetry, Strategy};
use crate::utils::{Clock, SystemClock};

/// Success rate and estimate error of one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEffectiveness {
    pub strategy: Strategy,
    pub executions: usize,
    pub success_rate: f64,
    /// Mean of `actual - estimated`; positive means estimates run low
    pub avg_latency_error_ms: f64,
    pub mean_abs_latency_error_ms: f64,
}

/// Correction evidence for one (query type, strategy) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub query_type: String,
    pub strategy: Strategy,
    pub samples: usize,
    /// Mean `actual / estimated`
    pub latency_bias: f64,
    /// Entries whose estimate came from learned graph data
    pub learned_samples: usize,
    /// Mean `actual / estimated` over those entries only
    pub learned_latency_bias: Option<f64>,
    pub estimation_accuracy: f64,
    pub success_rate: f64,
    /// Whether actual latency exceeded estimates beyond the configured tolerance
    pub underestimated: bool,
}

struct Recorded {
    seq: u64,
    telemetry: ExecutionTelemetry,
}

struct TelemetryState {
    entries: VecDeque<Recorded>,
    next_seq: u64,
    /// Entries with `seq` below this were already handed out by `take_calibration`
    calibrated_through: u64,
}

pub struct TelemetryCollector {
    state: Mutex<TelemetryState>,
    config: TelemetryConfig,
    clock: Arc<dyn Clock>,
}

impl TelemetryCollector {
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TelemetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TelemetryState {
                entries: VecDeque::new(),
                next_seq: 0,
                calibrated_through: 0,
            }),
            config,
            clock,
        }
    }

    pub fn record(&self, telemetry: ExecutionTelemetry) {
        let mut state = self.state.lock();
        self.prune_locked(&mut state);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back(Recorded { seq, telemetry });
    }

    /// Drop entries outside the retention window; returns how many were removed
    pub fn prune_expired(&self) -> usize {
        let mut state = self.state.lock();
        self.prune_locked(&mut state)
    }

    fn prune_locked(&self, state: &mut TelemetryState) -> usize {
        let cutoff = self.clock.now() - ChronoDuration::days(self.config.retention_days as i64);
        let before = state.entries.len();
        // Entries are appended in time order
        while state
            .entries
            .front()
            .is_some_and(|r| r.telemetry.recorded_at < cutoff)
        {
            state.entries.pop_front();
        }
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, retention_days = self.config.retention_days, "Pruned telemetry");
        }
        removed
    }

    /// Mean estimate accuracy for a query type (1 = estimates match actuals)
    pub fn estimation_accuracy(&self, query_type: &str) -> Option<f64> {
        let state = self.state.lock();
        mean(
            state
                .entries
                .iter()
                .map(|r| &r.telemetry)
                .filter(|t| t.query_type == query_type)
                .map(|t| estimate_accuracy(t.estimated_latency_ms, t.total_latency_ms)),
        )
    }

    pub fn strategy_effectiveness(&self, strategy: Strategy) -> Option<StrategyEffectiveness> {
        let state = self.state.lock();
        let matching: Vec<&ExecutionTelemetry> = state
            .entries
            .iter()
            .map(|r| &r.telemetry)
            .filter(|t| t.strategy_chosen == strategy)
            .collect();
        if matching.is_empty() {
            return None;
        }

        let n = matching.len() as f64;
        let successes = matching.iter().filter(|t| t.success).count() as f64;
        let errors: Vec<f64> = matching
            .iter()
            .map(|t| t.total_latency_ms - t.estimated_latency_ms)
            .collect();

        Some(StrategyEffectiveness {
            strategy,
            executions: matching.len(),
            success_rate: successes / n,
            avg_latency_error_ms: errors.iter().sum::<f64>() / n,
            mean_abs_latency_error_ms: errors.iter().map(|e| e.abs()).sum::<f64>() / n,
        })
    }

    /// Mean `actual / estimated` latency for a query type under one strategy
    pub fn latency_bias(&self, query_type: &str, strategy: Strategy) -> Option<f64> {
        let state = self.state.lock();
        mean(
            state
                .entries
                .iter()
                .map(|r| &r.telemetry)
                .filter(|t| t.query_type == query_type && t.strategy_chosen == strategy)
                .filter_map(bias_of),
        )
    }

    /// Calibration over every retained entry
    pub fn calibration(&self) -> Vec<Calibration> {
        let state = self.state.lock();
        self.calibrate(state.entries.iter().map(|r| &r.telemetry))
    }

    /// Calibration over entries recorded since the previous call
    ///
    /// Corrections derived from it are relative to the estimates in force
    /// since then, so applying them multiplicatively does not compound.
    pub fn take_calibration(&self) -> Vec<Calibration> {
        let mut state = self.state.lock();
        let since = state.calibrated_through;
        state.calibrated_through = state.next_seq;
        self.calibrate(
            state
                .entries
                .iter()
                .filter(|r| r.seq >= since)
                .map(|r| &r.telemetry),
        )
    }

    fn calibrate<'a>(&self, entries: impl Iterator<Item = &'a ExecutionTelemetry>) -> Vec<Calibration> {
        let mut groups: BTreeMap<(String, Strategy), Vec<&ExecutionTelemetry>> = BTreeMap::new();
        for entry in entries {
            groups
                .entry((entry.query_type.clone(), entry.strategy_chosen))
                .or_default()
                .push(entry);
        }

        groups
            .into_iter()
            .filter(|(_, group)| group.len() >= self.config.min_calibration_samples.max(1))
            .map(|((query_type, strategy), group)| {
                let n = group.len() as f64;
                let latency_bias = mean(group.iter().copied().filter_map(bias_of)).unwrap_or(1.0);
                let learned: Vec<&ExecutionTelemetry> =
                    group.iter().copied().filter(|t| t.learned_estimate).collect();
                let learned_latency_bias = mean(learned.iter().copied().filter_map(bias_of));
                let accuracy = group
                    .iter()
                    .map(|t| estimate_accuracy(t.estimated_latency_ms, t.total_latency_ms))
                    .sum::<f64>()
                    / n;
                let success_rate = group.iter().filter(|t| t.success).count() as f64 / n;

                Calibration {
                    query_type,
                    strategy,
                    samples: group.len(),
                    latency_bias,
                    learned_samples: learned.len(),
                    learned_latency_bias,
                    estimation_accuracy: clamp_unit(accuracy),
                    success_rate,
                    underestimated: latency_bias > self.config.underestimate_tolerance,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ExecutionTelemetry> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|r| r.telemetry.clone())
            .collect()
    }
}

fn bias_of(t: &ExecutionTelemetry) -> Option<f64> {
    (t.estimated_latency_ms > 0.0).then(|| t.total_latency_ms / t.estimated_latency_ms)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}
