//! Result Aggregator
//!
//! Merges per-layer results into one deduplicated response.
//!
//! - Records are identified by [`LayerRecord::id`].
//! - When sources disagree on an id, the higher-confidence source wins; ties
//!   go to the configured source priority, then to the source name. Arrival
//!   order never matters.
//! - Failed or missing sources make the response `Partial`; no records at all
//!   make it `NoMatches`. Neither is an error.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::AggregatorConfig;
use crate::error::EngineResult;
use crate::scoring::clamp_unit;
use crate::types::{LayerPayload, SourceConfidence};

/// What one source delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SourceResult {
    Records(LayerPayload),
    /// Timed out, errored or cancelled upstream
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Complete,
    Partial,
    NoMatches,
}

/// One deduplicated record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedItem {
    pub id: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Source whose value was kept
    pub source: String,
    pub source_confidence: f64,
    /// Other sources that returned the same id, sorted
    pub corroborated_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub status: AggregateStatus,
    /// Sorted by id
    pub items: Vec<MergedItem>,
    pub contributing_sources: Vec<String>,
    /// Expected sources that failed or never reported
    pub missing_sources: Vec<String>,
    pub failures: BTreeMap<String, String>,
}

impl AggregateResult {
    pub fn is_partial(&self) -> bool {
        self.status == AggregateStatus::Partial
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stable JSON encoding; identical inputs give byte-identical output
    pub fn to_canonical_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Well-formed response for a query where every source failed
    pub fn degraded(missing_sources: Vec<String>, failures: BTreeMap<String, String>) -> Self {
        Self {
            status: AggregateStatus::NoMatches,
            items: Vec::new(),
            contributing_sources: Vec::new(),
            missing_sources,
            failures,
        }
    }
}

struct Candidate<'a> {
    source: &'a str,
    confidence: f64,
    rank: usize,
    payload: &'a serde_json::Value,
    score: Option<f64>,
}

pub struct ResultAggregator {
    config: AggregatorConfig,
}

impl ResultAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    /// Confidence for a source: explicit entry, then configured, then default
    pub fn confidence_for(&self, source: &str, confidences: &HashMap<String, SourceConfidence>) -> f64 {
        confidences
            .get(source)
            .map(|c| c.weight)
            .or_else(|| self.config.source_confidence.get(source).copied())
            .map(clamp_unit)
            .unwrap_or(self.config.default_source_confidence)
    }

    /// Configured confidences for a set of sources
    pub fn configured_confidences<'a>(
        &self,
        sources: impl IntoIterator<Item = &'a String>,
    ) -> HashMap<String, SourceConfidence> {
        let empty = HashMap::new();
        sources
            .into_iter()
            .map(|source| {
                let weight = self.confidence_for(source, &empty);
                (source.clone(), SourceConfidence::new(source.clone(), weight))
            })
            .collect()
    }

    fn rank(&self, source: &str) -> usize {
        self.config
            .source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(usize::MAX)
    }

    /// Merge whatever sources reported
    pub fn merge(
        &self,
        per_source_results: &HashMap<String, SourceResult>,
        confidences: &HashMap<String, SourceConfidence>,
    ) -> AggregateResult {
        self.merge_expecting(per_source_results, confidences, &[])
    }

    /// Merge, treating any of `expected_sources` absent from the input as missing
    pub fn merge_expecting(
        &self,
        per_source_results: &HashMap<String, SourceResult>,
        confidences: &HashMap<String, SourceConfidence>,
        expected_sources: &[String],
    ) -> AggregateResult {
        // Fix iteration order up front
        let ordered: BTreeMap<&str, &SourceResult> = per_source_results
            .iter()
            .map(|(source, result)| (source.as_str(), result))
            .collect();

        let mut missing: BTreeSet<String> = expected_sources
            .iter()
            .filter(|s| !per_source_results.contains_key(*s))
            .cloned()
            .collect();
        let mut failures = BTreeMap::new();
        let mut contributing = Vec::new();
        let mut by_id: BTreeMap<&str, Vec<Candidate<'_>>> = BTreeMap::new();

        for (source, result) in ordered {
            let records = match result {
                SourceResult::Records(records) => records,
                SourceResult::Failed(reason) => {
                    missing.insert(source.to_string());
                    failures.insert(source.to_string(), reason.clone());
                    continue;
                }
            };
            contributing.push(source.to_string());

            let confidence = self.confidence_for(source, confidences);
            let rank = self.rank(source);
            let mut seen = BTreeSet::new();
            for record in records {
                // First occurrence within a source wins
                if !seen.insert(record.id.as_str()) {
                    continue;
                }
                by_id.entry(record.id.as_str()).or_default().push(Candidate {
                    source,
                    confidence,
                    rank,
                    payload: &record.payload,
                    score: record.score,
                });
            }
        }

        let items: Vec<MergedItem> = by_id
            .into_iter()
            .filter_map(|(id, mut candidates)| {
                candidates.sort_by(compare_candidates);
                let mut iter = candidates.into_iter();
                let winner = iter.next()?;
                let mut corroborated_by: Vec<String> = iter.map(|c| c.source.to_string()).collect();
                corroborated_by.sort();

                Some(MergedItem {
                    id: id.to_string(),
                    payload: winner.payload.clone(),
                    score: winner.score,
                    source: winner.source.to_string(),
                    source_confidence: winner.confidence,
                    corroborated_by,
                })
            })
            .collect();

        let status = if items.is_empty() {
            AggregateStatus::NoMatches
        } else if !missing.is_empty() {
            AggregateStatus::Partial
        } else {
            AggregateStatus::Complete
        };

        AggregateResult {
            status,
            items,
            contributing_sources: contributing,
            missing_sources: missing.into_iter().collect(),
            failures,
        }
    }
}

/// Best candidate first: confidence, then priority rank, then name
fn compare_candidates(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then(a.rank.cmp(&b.rank))
        .then(a.source.cmp(b.source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LayerRecord;
    use serde_json::json;

    fn records(source: &str, ids: &[&str]) -> SourceResult {
        SourceResult::Records(
            ids.iter()
                .map(|id| LayerRecord::new(*id, json!({"from": source, "id": id})))
                .collect(),
        )
    }

    fn confidences(pairs: &[(&str, f64)]) -> HashMap<String, SourceConfidence> {
        pairs
            .iter()
            .map(|(s, w)| (s.to_string(), SourceConfidence::new(*s, *w)))
            .collect()
    }

    #[test]
    fn test_higher_confidence_source_wins() {
        let aggregator = ResultAggregator::new(AggregatorConfig::default());
        let mut input = HashMap::new();
        input.insert("episodic".to_string(), records("episodic", &["1", "2"]));
        input.insert("semantic".to_string(), records("semantic", &["2", "3"]));

        let result = aggregator.merge(&input, &confidences(&[("episodic", 0.6), ("semantic", 0.9)]));
        assert_eq!(result.status, AggregateStatus::Complete);

        let ids: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(result.items[1].source, "semantic");
        assert_eq!(result.items[1].payload["from"], "semantic");
        assert_eq!(result.items[1].corroborated_by, vec!["episodic"]);
    }

    #[test]
    fn test_confidence_tie_uses_priority() {
        let aggregator = ResultAggregator::new(AggregatorConfig {
            source_priority: vec!["graph".into(), "episodic".into()],
            ..AggregatorConfig::default()
        });
        let mut input = HashMap::new();
        input.insert("episodic".to_string(), records("episodic", &["7"]));
        input.insert("graph".to_string(), records("graph", &["7"]));

        let result = aggregator.merge(&input, &confidences(&[("episodic", 0.7), ("graph", 0.7)]));
        assert_eq!(result.items[0].source, "graph");
    }

    #[test]
    fn test_configured_confidence_used_when_not_supplied() {
        let aggregator = ResultAggregator::new(AggregatorConfig::default());
        let mut input = HashMap::new();
        input.insert("episodic".to_string(), records("episodic", &["1"]));
        input.insert("semantic".to_string(), records("semantic", &["1"]));

        // semantic 0.8 beats episodic 0.6 by default
        let result = aggregator.merge(&input, &HashMap::new());
        assert_eq!(result.items[0].source, "semantic");
        assert_eq!(result.items[0].source_confidence, 0.8);
    }

    #[test]
    fn test_partial_and_no_matches() {
        let aggregator = ResultAggregator::new(AggregatorConfig::default());
        let mut input = HashMap::new();
        input.insert("episodic".to_string(), records("episodic", &["1"]));
        input.insert("semantic".to_string(), SourceResult::Failed("timed out after 50ms".into()));

        let expected = vec!["episodic".to_string(), "semantic".to_string(), "graph".to_string()];
        let result = aggregator.merge_expecting(&input, &HashMap::new(), &expected);
        assert!(result.is_partial());
        assert_eq!(result.missing_sources, vec!["graph", "semantic"]);
        assert_eq!(result.contributing_sources, vec!["episodic"]);
        assert!(result.failures["semantic"].contains("timed out"));

        let mut failed = HashMap::new();
        failed.insert("semantic".to_string(), SourceResult::Failed("boom".into()));
        let result = aggregator.merge(&failed, &HashMap::new());
        assert_eq!(result.status, AggregateStatus::NoMatches);
        assert!(result.is_empty());

        let result = aggregator.merge(&HashMap::new(), &HashMap::new());
        assert_eq!(result.status, AggregateStatus::NoMatches);
    }

    #[test]
    fn test_duplicates_within_source_keep_first() {
        let aggregator = ResultAggregator::new(AggregatorConfig::default());
        let mut input = HashMap::new();
        input.insert(
            "episodic".to_string(),
            SourceResult::Records(vec![
                LayerRecord::new("1", json!("first")),
                LayerRecord::new("1", json!("second")),
            ]),
        );

        let result = aggregator.merge(&input, &HashMap::new());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].payload, json!("first"));
        assert!(result.items[0].corroborated_by.is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let aggregator = ResultAggregator::new(AggregatorConfig::default());
        let sources = [
            ("episodic", records("episodic", &["1", "2", "4"])),
            ("semantic", records("semantic", &["2", "3"])),
            ("graph", records("graph", &["3", "4", "5"])),
            ("procedural", SourceResult::Failed("unavailable".into())),
        ];

        let mut forward = HashMap::new();
        for (s, r) in sources.iter().cloned() {
            forward.insert(s.to_string(), r);
        }
        let mut reverse = HashMap::new();
        for (s, r) in sources.iter().rev().cloned() {
            reverse.insert(s.to_string(), r);
        }

        let a = aggregator.merge(&forward, &HashMap::new()).to_canonical_json().unwrap();
        let b = aggregator.merge(&forward, &HashMap::new()).to_canonical_json().unwrap();
        let c = aggregator.merge(&reverse, &HashMap::new()).to_canonical_json().unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }
}
