//! Scoring Utilities
//!
//! Every confidence and score in the engine goes through these functions so
//! the numeric semantics stay consistent: inputs are weighted, results are
//! clamped to `[0, 1]`, and non-finite inputs count as zero.

/// Clamp a value into `[0, 1]`, mapping NaN and infinities to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Weighted average of `(value, weight)` pairs, clamped to `[0, 1]`
///
/// Values are clamped before weighting. Returns 0 when the total weight is 0.
pub fn weighted_score(components: &[(f64, f64)]) -> f64 {
    let mut total = 0.0;
    let mut total_weight = 0.0;

    for &(value, weight) in components {
        if !weight.is_finite() || weight <= 0.0 {
            continue;
        }
        total += clamp_unit(value) * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        clamp_unit(total / total_weight)
    } else {
        0.0
    }
}

/// Linear freshness decay: 1 at age 0, 0 at `ttl_secs` and beyond
pub fn freshness(age_secs: f64, ttl_secs: f64) -> f64 {
    if ttl_secs <= 0.0 {
        return 0.0;
    }
    clamp_unit(1.0 - age_secs.max(0.0) / ttl_secs)
}

/// Map a ratio onto `[0, 1]` with `saturation` as the value that scores 1
pub fn saturating_ratio(value: f64, saturation: f64) -> f64 {
    if saturation <= 0.0 {
        return 0.0;
    }
    clamp_unit(value / saturation)
}

/// How evenly a set of latencies is spread
///
/// 1 when all latencies are equal, approaching 0 when one dominates.
/// Computed as the share of sequential time that parallel execution saves,
/// normalized by the best possible saving for that many layers.
pub fn latency_balance(latencies: &[f64]) -> f64 {
    let positive: Vec<f64> = latencies
        .iter()
        .copied()
        .filter(|l| l.is_finite() && *l > 0.0)
        .collect();
    if positive.len() < 2 {
        return 0.0;
    }

    let sum: f64 = positive.iter().sum();
    let max = positive.iter().copied().fold(0.0, f64::max);
    let n = positive.len() as f64;

    let saving = (sum - max) / sum;
    let best_saving = (n - 1.0) / n;
    clamp_unit(saving / best_saving)
}

/// Accuracy of an estimate: 1 when exact, falling toward 0 as they diverge
pub fn estimate_accuracy(estimated: f64, actual: f64) -> f64 {
    let high = estimated.max(actual);
    if high <= 0.0 {
        return 1.0;
    }
    clamp_unit(estimated.min(actual).max(0.0) / high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_score() {
        let score = weighted_score(&[(0.9, 2.0), (0.6, 1.0)]);
        // (0.9 * 2 + 0.6) / 3 = 0.8
        assert!((score - 0.8).abs() < 1e-9);

        assert_eq!(weighted_score(&[]), 0.0);
        assert_eq!(weighted_score(&[(0.5, 0.0)]), 0.0);
        assert_eq!(weighted_score(&[(3.0, 1.0)]), 1.0);
        assert_eq!(weighted_score(&[(f64::NAN, 1.0)]), 0.0);
    }

    #[test]
    fn test_freshness_is_monotonic() {
        let mut previous = f64::MAX;
        for age in 0..=400 {
            let f = freshness(age as f64, 300.0);
            assert!(f <= previous);
            assert!((0.0..=1.0).contains(&f));
            previous = f;
        }
        assert_eq!(freshness(0.0, 300.0), 1.0);
        assert!((freshness(150.0, 300.0) - 0.5).abs() < 1e-9);
        assert_eq!(freshness(300.0, 300.0), 0.0);
    }

    #[test]
    fn test_latency_balance() {
        // Comparable latencies
        assert!(latency_balance(&[80.0, 70.0]) > 0.8);
        assert_eq!(latency_balance(&[50.0, 50.0, 50.0]), 1.0);

        // One layer dominates
        assert!(latency_balance(&[500.0, 5.0]) < 0.05);

        // Nothing to parallelize
        assert_eq!(latency_balance(&[80.0]), 0.0);
        assert_eq!(latency_balance(&[]), 0.0);
    }

    #[test]
    fn test_estimate_accuracy() {
        assert_eq!(estimate_accuracy(100.0, 100.0), 1.0);
        assert!((estimate_accuracy(50.0, 100.0) - 0.5).abs() < 1e-9);
        assert!((estimate_accuracy(100.0, 50.0) - 0.5).abs() < 1e-9);
        assert_eq!(estimate_accuracy(0.0, 0.0), 1.0);
    }
}
