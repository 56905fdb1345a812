//! Load Balancer
//!
//! Compares completed-task throughput over a sliding window against the
//! configured target and moves the pool's worker target between
//! `min_workers` and `max_workers`. Runs on its own interval, never per task.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::PoolConfig;

/// Completion timestamps inside a sliding window
#[derive(Debug)]
pub struct ThroughputWindow {
    window: Duration,
    completions: VecDeque<Instant>,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            completions: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.evict(at);
        self.completions.push_back(at);
    }

    /// Completions per second over the window ending at `now`
    pub fn qps(&mut self, now: Instant) -> f64 {
        self.evict(now);
        self.completions.len() as f64 / self.window.as_secs_f64()
    }

    /// Completions currently held
    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.completions.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Inputs to one balancing decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub current_workers: usize,
    pub observed_qps: f64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "workers")]
pub enum ScaleDecision {
    Grow(usize),
    Shrink(usize),
    Hold,
}

/// Pure scaling rule derived from [`PoolConfig`]
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    min_workers: usize,
    max_workers: usize,
    target_qps: f64,
    scale_up_ratio: f64,
    scale_down_ratio: f64,
}

impl ScalingPolicy {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers.max(config.min_workers),
            target_qps: config.target_qps,
            scale_up_ratio: config.scale_up_ratio,
            scale_down_ratio: config.scale_down_ratio,
        }
    }

    /// Decide the next worker target
    ///
    /// Grows when throughput approaches the target or tasks are waiting with
    /// more backlog than workers; shrinks only when throughput is low and the
    /// queue is empty. A backlog doubles the pool, anything else moves by one.
    pub fn decide(&self, sample: LoadSample) -> ScaleDecision {
        let current = sample.current_workers;
        if current < self.min_workers {
            return ScaleDecision::Grow(self.min_workers);
        }
        if current > self.max_workers {
            return ScaleDecision::Shrink(self.max_workers);
        }

        let backlogged = sample.queue_depth > current;
        let busy = sample.observed_qps > self.target_qps * self.scale_up_ratio;
        let idle = sample.queue_depth == 0 && sample.observed_qps < self.target_qps * self.scale_down_ratio;

        if (backlogged || busy) && current < self.max_workers {
            let next = if backlogged { current.max(1) * 2 } else { current + 1 };
            ScaleDecision::Grow(next.min(self.max_workers))
        } else if idle && !backlogged && current > self.min_workers {
            ScaleDecision::Shrink(current - 1)
        } else {
            ScaleDecision::Hold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalingPolicy {
        ScalingPolicy::new(&PoolConfig {
            min_workers: 2,
            max_workers: 8,
            target_qps: 50.0,
            ..PoolConfig::default()
        })
    }

    fn sample(current_workers: usize, observed_qps: f64, queue_depth: usize) -> LoadSample {
        LoadSample {
            current_workers,
            observed_qps,
            queue_depth,
        }
    }

    #[test]
    fn test_grow_on_throughput() {
        assert_eq!(policy().decide(sample(2, 45.0, 0)), ScaleDecision::Grow(3));
    }

    #[test]
    fn test_grow_on_backlog_is_capped() {
        assert_eq!(policy().decide(sample(3, 0.0, 10)), ScaleDecision::Grow(6));
        assert_eq!(policy().decide(sample(6, 0.0, 20)), ScaleDecision::Grow(8));
        assert_eq!(policy().decide(sample(8, 100.0, 20)), ScaleDecision::Hold);
    }

    #[test]
    fn test_shrink_when_idle() {
        assert_eq!(policy().decide(sample(5, 1.0, 0)), ScaleDecision::Shrink(4));
        assert_eq!(policy().decide(sample(2, 0.0, 0)), ScaleDecision::Hold);
        // Waiting tasks block shrinking
        assert_eq!(policy().decide(sample(5, 1.0, 2)), ScaleDecision::Hold);
    }

    #[test]
    fn test_out_of_bounds_is_clamped() {
        assert_eq!(policy().decide(sample(0, 0.0, 0)), ScaleDecision::Grow(2));
        assert_eq!(policy().decide(sample(12, 0.0, 0)), ScaleDecision::Shrink(8));
    }

    #[test]
    fn test_throughput_window() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(10));
        for i in 0..20 {
            window.record(start + Duration::from_millis(i * 100));
        }
        assert!((window.qps(start + Duration::from_secs(2)) - 2.0).abs() < 1e-9);

        // Everything recorded in the first two seconds has left the window
        assert_eq!(window.qps(start + Duration::from_secs(13)), 0.0);
    }

    #[test]
    fn test_record_evicts_without_reads() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(1));
        for batch in 0..5u64 {
            let at = start + Duration::from_millis(batch * 1_100);
            for _ in 0..200 {
                window.record(at);
            }
        }
        // Only the last batch is inside the one-second window
        assert_eq!(window.len(), 200);
    }
}
