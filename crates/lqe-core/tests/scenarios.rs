//! End-to-end behaviour of the query execution core

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lqe_core::config::{CacheConfig, GraphConfig, PoolConfig, SelectorConfig};
use lqe_core::utils::ManualClock;
use lqe_core::{
    AggregateStatus, CacheKey, CrossLayerCache, DependencyGraph, EngineConfig, ExecutionEngine, LayerRecord,
    QueryAnalysis, QueryFnRegistry, QueryMetrics, QueryRequest, Recommendation, ResultAggregator, SourceConfidence,
    SourceResult, Strategy, StrategySelector, TaskError, WorkerPool, WorkerTask,
};
use serde_json::{Value, json};

fn temporal_sample(episodic_ms: f64, semantic_ms: f64) -> QueryMetrics {
    QueryMetrics::new(
        uuid::Uuid::new_v4().to_string(),
        "temporal",
        vec![
            ("episodic".to_string(), episodic_ms),
            ("semantic".to_string(), semantic_ms),
        ],
    )
}

fn selector_fixture(min_samples: usize) -> (StrategySelector, Arc<DependencyGraph>, Arc<CrossLayerCache>) {
    let graph = Arc::new(DependencyGraph::new(GraphConfig {
        min_samples,
        ..GraphConfig::default()
    }));
    let cache = Arc::new(CrossLayerCache::new(CacheConfig::default()));
    let selector = StrategySelector::new(SelectorConfig::default(), graph.clone(), cache.clone(), 8);
    (selector, graph, cache)
}

#[test]
fn test_unseen_query_type_runs_sequential() {
    let (selector, _graph, _cache) = selector_fixture(3);
    let decision = selector.select("q1", &QueryAnalysis::new("temporal", ["episodic", "semantic"]));

    assert_eq!(decision.strategy, Strategy::Sequential);
    assert_eq!(decision.fallback_strategy, Strategy::Sequential);
    assert!(decision.reasoning.iter().any(|r| r.contains("insufficient data")));
}

#[test]
fn test_learned_temporal_pattern_runs_parallel() {
    let (selector, graph, _cache) = selector_fixture(3);
    for (e, s) in [(80.0, 70.0), (81.0, 71.0), (79.0, 69.0), (80.0, 70.0), (82.0, 72.0)] {
        graph.observe(&temporal_sample(e, s));
    }

    match graph.recommend("temporal") {
        Recommendation::Ready(rec) => assert!(rec.parallel_benefit_score > 0.0),
        other => panic!("expected a recommendation, got {:?}", other),
    }

    let decision = selector.select("q1", &QueryAnalysis::new("temporal", ["episodic", "semantic"]));
    assert_eq!(decision.strategy, Strategy::Parallel);
    assert_eq!(decision.fallback_strategy, Strategy::Sequential);
}

#[test]
fn test_recommend_abstains_below_min_samples() {
    for min_samples in [1usize, 3, 10] {
        let graph = DependencyGraph::new(GraphConfig {
            min_samples,
            ..GraphConfig::default()
        });
        for observed in 0..min_samples {
            assert!(graph.recommend("temporal").is_insufficient(), "{} of {}", observed, min_samples);
            graph.observe(&temporal_sample(80.0, 70.0));
        }
        assert!(!graph.recommend("temporal").is_insufficient());
    }
}

#[test]
fn test_cache_confidence_decays_then_misses() {
    let clock = Arc::new(ManualClock::default());
    let cache = CrossLayerCache::with_clock(CacheConfig::default(), clock.clone());
    let key = CacheKey::fingerprint("temporal", ["episodic", "semantic"], &BTreeMap::new());
    let mut payload = BTreeMap::new();
    payload.insert("episodic".to_string(), vec![LayerRecord::new("1", json!("a"))]);

    cache.put_with_confidence(
        key.clone(),
        vec!["episodic".into(), "semantic".into()],
        payload,
        Some(300),
        0.95,
    );

    clock.advance_secs(150);
    let hit = cache.get(&key).expect("entry should still be live");
    assert!((hit.confidence - 0.5).abs() < 1e-6);

    clock.advance_secs(151);
    assert!(cache.get(&key).is_none());
}

#[test]
fn test_cache_evicts_least_recently_accessed() {
    let cache = CrossLayerCache::new(CacheConfig {
        max_entries: 4,
        ..CacheConfig::default()
    });
    let keys: Vec<CacheKey> = (0..4)
        .map(|i| CacheKey::fingerprint(&format!("type-{}", i), ["episodic"], &BTreeMap::new()))
        .collect();
    for key in &keys {
        cache.put(key.clone(), vec!["episodic".into()], BTreeMap::new(), None);
    }

    // Access order: 2, 0, 3; key 1 is now least recently accessed
    for i in [2, 0, 3] {
        assert!(cache.get(&keys[i]).is_some());
    }
    let extra = CacheKey::fingerprint("type-extra", ["episodic"], &BTreeMap::new());
    cache.put(extra.clone(), vec!["episodic".into()], BTreeMap::new(), None);

    assert_eq!(cache.len(), 4);
    assert!(cache.get(&keys[1]).is_none());
    for i in [0, 2, 3] {
        assert!(cache.get(&keys[i]).is_some());
    }
}

#[test]
fn test_aggregator_prefers_higher_confidence_source() {
    let aggregator = ResultAggregator::new(Default::default());
    let mut input = HashMap::new();
    input.insert(
        "episodic".to_string(),
        SourceResult::Records(vec![
            LayerRecord::new("1", json!({"v": "episodic-1"})),
            LayerRecord::new("2", json!({"v": "episodic-2"})),
        ]),
    );
    input.insert(
        "semantic".to_string(),
        SourceResult::Records(vec![
            LayerRecord::new("2", json!({"v": "semantic-2"})),
            LayerRecord::new("3", json!({"v": "semantic-3"})),
        ]),
    );
    let mut confidences = HashMap::new();
    confidences.insert("episodic".to_string(), SourceConfidence::new("episodic", 0.5));
    confidences.insert("semantic".to_string(), SourceConfidence::new("semantic", 0.9));

    let result = aggregator.merge(&input, &confidences);
    let ids: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(result.items[1].payload, json!({"v": "semantic-2"}));
    assert_eq!(result.status, AggregateStatus::Complete);

    // Same inputs, same bytes
    let again = aggregator.merge(&input, &confidences);
    assert_eq!(
        result.to_canonical_json().unwrap(),
        again.to_canonical_json().unwrap()
    );
}

#[tokio::test]
async fn test_slow_task_does_not_block_batch() {
    let registry = QueryFnRegistry::new();
    registry.register_fn("layer::search", |_args, kwargs| async move {
        let ms = kwargs.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(vec![LayerRecord::new("r", Value::Null)])
    });
    let pool = WorkerPool::new(
        PoolConfig {
            min_workers: 8,
            max_workers: 8,
            ..PoolConfig::default()
        },
        Arc::new(registry),
    )
    .unwrap();

    let tasks: Vec<WorkerTask> = (0..20)
        .map(|i| {
            let task = WorkerTask::new(format!("partition-{}", i), "layer::search");
            if i == 7 {
                task.with_kwarg("sleep_ms", json!(10_000))
                    .with_timeout(Duration::from_millis(200))
            } else {
                task.with_kwarg("sleep_ms", json!(50))
                    .with_timeout(Duration::from_secs(5))
            }
        })
        .collect();

    let started = Instant::now();
    let results = pool.submit_batch(tasks).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 20);
    assert_eq!(results.iter().filter(|r| r.success()).count(), 19);
    assert_eq!(results[7].error(), Some(&TaskError::TimedOut(200)));
    // Three 50ms waves on eight workers plus the 200ms timeout, not the 10s sleep
    assert!(elapsed < Duration::from_secs(2), "batch took {:?}", elapsed);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_engine_learns_and_reuses() {
    let config = EngineConfig::default()
        .with_graph(GraphConfig {
            min_samples: 3,
            ..GraphConfig::default()
        })
        .with_pool(PoolConfig {
            min_workers: 4,
            max_workers: 4,
            ..PoolConfig::default()
        });
    let engine = ExecutionEngine::new(config, Arc::new(QueryFnRegistry::new())).unwrap();
    for layer in ["episodic", "semantic"] {
        engine.register_layer(layer, move |_args, _kwargs| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(vec![LayerRecord::new(format!("{}-1", layer), json!({ "layer": layer }))])
        });
    }

    let analysis = QueryAnalysis::new("temporal", ["episodic", "semantic"]).not_cacheable();
    let mut strategies = Vec::new();
    for _ in 0..5 {
        let response = engine
            .execute(QueryRequest::new("what happened yesterday", analysis.clone()))
            .await
            .unwrap();
        assert_eq!(response.result.items.len(), 2);
        strategies.push(response.executed_strategy);
    }

    assert_eq!(&strategies[..3], &[Strategy::Sequential; 3]);
    assert_eq!(&strategies[3..], &[Strategy::Parallel; 2]);

    let stats = engine.profiler().stats_for("temporal").unwrap();
    assert_eq!(stats.count, 5);
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(engine.telemetry().len(), 5);
    assert!(engine.telemetry().strategy_effectiveness(Strategy::Parallel).is_some());
    engine.shutdown().await;
}
