//! Simulated memory layers and workload generation.
//!
//! Each layer sleeps for a jittered latency drawn from its profile and then
//! returns records whose ids overlap with neighbouring layers, so the
//! aggregator has duplicates to resolve.

use lqe_core::{ExecutionEngine, LayerRecord, QueryAnalysis, QueryRequest};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Ids per subject that layers draw from
const ID_SPACE: usize = 8;

/// Latency and size profile of one simulated layer
#[derive(Debug, Clone, Copy)]
pub struct LayerProfile {
    pub name: &'static str,
    pub base_latency_ms: f64,
    pub jitter_ms: f64,
    pub records: usize,
}

pub const LAYERS: [LayerProfile; 6] = [
    LayerProfile { name: "episodic", base_latency_ms: 40.0, jitter_ms: 10.0, records: 3 },
    LayerProfile { name: "semantic", base_latency_ms: 35.0, jitter_ms: 8.0, records: 4 },
    LayerProfile { name: "procedural", base_latency_ms: 25.0, jitter_ms: 5.0, records: 2 },
    LayerProfile { name: "graph", base_latency_ms: 60.0, jitter_ms: 20.0, records: 3 },
    LayerProfile { name: "working", base_latency_ms: 5.0, jitter_ms: 2.0, records: 1 },
    LayerProfile { name: "archival", base_latency_ms: 120.0, jitter_ms: 30.0, records: 5 },
];

/// A query type and the layers the classifier routes it to
#[derive(Debug, Clone, Copy)]
pub struct QueryTemplate {
    pub query_type: &'static str,
    pub layers: &'static [&'static str],
    pub cacheable: bool,
}

pub const WORKLOAD: [QueryTemplate; 5] = [
    QueryTemplate { query_type: "temporal", layers: &["episodic", "semantic"], cacheable: true },
    QueryTemplate { query_type: "factual", layers: &["semantic"], cacheable: true },
    QueryTemplate { query_type: "howto", layers: &["procedural", "semantic"], cacheable: true },
    QueryTemplate { query_type: "relational", layers: &["graph", "semantic", "episodic"], cacheable: true },
    QueryTemplate {
        query_type: "exhaustive",
        layers: &["episodic", "semantic", "procedural", "graph", "working", "archival"],
        cacheable: false,
    },
];

const SUBJECTS: [&str; 10] = [
    "deploy", "billing", "oncall", "roadmap", "hiring", "incident", "pricing", "security", "migration", "backlog",
];

/// Shared randomness for layers and the workload generator
#[derive(Clone)]
pub struct Simulation {
    rng: Arc<Mutex<StdRng>>,
    failure_rate: f64,
}

impl Simulation {
    pub fn new(seed: Option<u64>, failure_rate: f64) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Arc::new(Mutex::new(rng)),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    /// Register every simulated layer's query function on the engine
    pub fn register(&self, engine: &ExecutionEngine) {
        for (index, profile) in LAYERS.iter().copied().enumerate() {
            let sim = self.clone();
            engine.register_layer(profile.name, move |_args, kwargs| {
                let sim = sim.clone();
                async move {
                    let (delay_ms, fail) = sim.draw_call(&profile);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if fail {
                        anyhow::bail!("{} layer unavailable", profile.name);
                    }

                    let subject = kwargs.get("subject").and_then(Value::as_str).unwrap_or("general");
                    Ok(records_for(subject, index, &profile))
                }
            });
        }
    }

    fn draw_call(&self, profile: &LayerProfile) -> (u64, bool) {
        let mut rng = self.rng.lock();
        let jitter = rng.gen_range(-profile.jitter_ms..=profile.jitter_ms);
        let delay = (profile.base_latency_ms + jitter).max(1.0) as u64;
        (delay, rng.gen_bool(self.failure_rate))
    }

    /// Next query of the workload
    ///
    /// With probability `repeat_ratio` an earlier query is reissued verbatim,
    /// which is what lets cache-worthy types hit the cross-layer cache.
    pub fn next_request(&self, history: &mut Vec<(String, QueryAnalysis)>, repeat_ratio: f64) -> QueryRequest {
        let mut rng = self.rng.lock();
        if !history.is_empty() && rng.gen_bool(repeat_ratio.clamp(0.0, 1.0)) {
            if let Some((text, analysis)) = history.choose(&mut *rng) {
                return QueryRequest::new(text.clone(), analysis.clone());
            }
        }

        let template = WORKLOAD[rng.gen_range(0..WORKLOAD.len())];
        let subject = SUBJECTS[rng.gen_range(0..SUBJECTS.len())];
        let text = format!("{} question about {}", template.query_type, subject);
        let mut analysis = QueryAnalysis::new(template.query_type, template.layers.iter().copied())
            .with_param("subject", subject);
        if !template.cacheable {
            analysis = analysis.not_cacheable();
        }

        history.push((text.clone(), analysis.clone()));
        QueryRequest::new(text, analysis)
    }
}

/// Records a layer returns for a subject; neighbouring layers share ids
fn records_for(subject: &str, layer_index: usize, profile: &LayerProfile) -> Vec<LayerRecord> {
    (0..profile.records)
        .map(|k| {
            let slot = (layer_index + k) % ID_SPACE;
            LayerRecord::new(
                format!("{}-{}", subject, slot),
                json!({ "layer": profile.name, "subject": subject, "slot": slot }),
            )
            .with_score(1.0 - k as f64 / profile.records as f64)
        })
        .collect()
}
