//! Execution Engine
//!
//! Owns one instance of every component and runs the control loop for each
//! query:
//!
//! ```text
//! select -> cache | pool (with fallback) -> aggregate
//!        -> profiler -> dependency graph -> telemetry -> periodic recalibration
//! ```
//!
//! Components are shared through `Arc`s handed out by the accessors; there
//! is no process-wide state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregateResult, ResultAggregator, SourceResult};
use crate::cache::{CacheKey, CrossLayerCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::graph::DependencyGraph;
use crate::pool::{QueryFnRegistry, WorkerPool};
use crate::profiler::PerformanceProfiler;
use crate::selector::StrategySelector;
use crate::telemetry::{Calibration, TelemetryCollector};
use crate::types::{
    ExecutionTelemetry, LayerPayload, QueryAnalysis, QueryMetrics, Strategy, StrategyDecision, TaskPriority,
    WorkerTask, WorkerTaskResult,
};
use crate::utils::{Clock, SystemClock};

/// How often expired cache and telemetry entries are swept
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Per-layer timeout when the request does not set one
const DEFAULT_LAYER_TIMEOUT: Duration = Duration::from_secs(30);

/// Graph corrections smaller than this are not worth applying
const MIN_CORRECTION_DELTA: f64 = 0.1;

/// Registry name of a layer's query function
pub fn query_fn_name(layer: &str) -> String {
    format!("{}::search", layer)
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response
// ─────────────────────────────────────────────────────────────────────────────

/// One query to execute
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_id: String,
    pub query_text: String,
    pub analysis: QueryAnalysis,
    pub priority: TaskPriority,
    pub layer_timeout: Duration,
    /// Caller-level deadline over all layer calls
    pub deadline: Option<Duration>,
}

impl QueryRequest {
    pub fn new(query_text: impl Into<String>, analysis: QueryAnalysis) -> Self {
        Self {
            query_id: uuid::Uuid::new_v4().to_string(),
            query_text: query_text.into(),
            analysis,
            priority: TaskPriority::default(),
            layer_timeout: DEFAULT_LAYER_TIMEOUT,
            deadline: None,
        }
    }

    pub fn with_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_layer_timeout(mut self, timeout: Duration) -> Self {
        self.layer_timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Task for one layer: query text as the first argument, query type and
    /// parameters as keyword arguments
    fn task_for(&self, layer: &str) -> WorkerTask {
        let mut task = WorkerTask::new(layer, query_fn_name(layer))
            .with_arg(Value::String(self.query_text.clone()))
            .with_kwarg("query_type", Value::String(self.analysis.query_type.clone()))
            .with_priority(self.priority)
            .with_timeout(self.layer_timeout);
        for (key, value) in &self.analysis.params {
            task = task.with_kwarg(key.clone(), Value::String(value.clone()));
        }
        task
    }
}

/// Outcome of [`ExecutionEngine::execute`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub decision: StrategyDecision,
    /// Differs from `decision.strategy` when the chosen path failed outright
    pub executed_strategy: Strategy,
    pub result: AggregateResult,
    pub cache_hit: bool,
    pub latency_ms: f64,
    pub layer_latencies: BTreeMap<String, f64>,
}

impl QueryResponse {
    pub fn fell_back(&self) -> bool {
        self.executed_strategy != self.decision.strategy
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution paths
// ─────────────────────────────────────────────────────────────────────────────

struct PathOutcome {
    per_source: HashMap<String, SourceResult>,
    layers: Vec<String>,
    layer_latencies: BTreeMap<String, f64>,
    cache_hit: bool,
}

impl PathOutcome {
    fn from_results(layers: &[String], results: Vec<WorkerTaskResult>) -> Self {
        let mut per_source = HashMap::new();
        let mut layer_latencies = BTreeMap::new();
        for result in results {
            match result.outcome {
                Ok(payload) => {
                    layer_latencies.insert(result.layer_name.clone(), result.latency_ms);
                    per_source.insert(result.layer_name, SourceResult::Records(payload));
                }
                Err(err) => {
                    per_source.insert(result.layer_name, SourceResult::Failed(err.to_string()));
                }
            }
        }
        Self {
            per_source,
            layers: layers.to_vec(),
            layer_latencies,
            cache_hit: false,
        }
    }

    /// Raw payloads of every source that answered
    fn successful_payloads(&self) -> BTreeMap<String, LayerPayload> {
        self.per_source
            .iter()
            .filter_map(|(source, result)| match result {
                SourceResult::Records(records) => Some((source.clone(), records.clone())),
                SourceResult::Failed(_) => None,
            })
            .collect()
    }
}

/// Why a strategy could not run at all
enum PathFailure {
    CacheMiss,
    Rejected(EngineError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ExecutionEngine {
    config: EngineConfig,
    profiler: Arc<PerformanceProfiler>,
    graph: Arc<DependencyGraph>,
    cache: Arc<CrossLayerCache>,
    pool: Arc<WorkerPool>,
    selector: Arc<StrategySelector>,
    aggregator: Arc<ResultAggregator>,
    telemetry: Arc<TelemetryCollector>,
    clock: Arc<dyn Clock>,
    executed: AtomicUsize,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionEngine {
    /// Build every component from `config`
    ///
    /// Fails fast on invalid configuration. Must be called from within a Tokio
    /// runtime since the worker pool starts immediately.
    pub fn new(config: EngineConfig, registry: Arc<QueryFnRegistry>) -> EngineResult<Self> {
        Self::with_clock(config, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        registry: Arc<QueryFnRegistry>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let profiler = Arc::new(PerformanceProfiler::new(&config.profiler));
        let graph = Arc::new(DependencyGraph::new(config.graph.clone()));
        let cache = Arc::new(CrossLayerCache::with_clock(config.cache.clone(), clock.clone()));
        let pool = Arc::new(WorkerPool::new(config.pool.clone(), registry)?);
        let selector = Arc::new(StrategySelector::new(
            config.selector.clone(),
            graph.clone(),
            cache.clone(),
            pool.target_workers(),
        ));
        let aggregator = Arc::new(ResultAggregator::new(config.aggregator.clone()));
        let telemetry = Arc::new(TelemetryCollector::with_clock(config.telemetry.clone(), clock.clone()));

        Ok(Self {
            config,
            profiler,
            graph,
            cache,
            pool,
            selector,
            aggregator,
            telemetry,
            clock,
            executed: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        })
    }

    /// Register the query function for a layer under [`query_fn_name`]
    pub fn register_layer<F, Fut>(&self, layer: &str, f: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<LayerPayload>> + Send + 'static,
    {
        self.pool.registry().register_fn(query_fn_name(layer), f);
    }

    /// Run one query end to end
    ///
    /// Layer failures, timeouts and empty results come back as a well-formed
    /// response. Only contract violations such as executing after shutdown
    /// are errors.
    pub async fn execute(&self, request: QueryRequest) -> EngineResult<QueryResponse> {
        self.selector.set_pool_capacity(self.pool.target_workers());
        let decision = self.selector.select(request.query_id.clone(), &request.analysis);
        self.execute_with_decision(request, decision).await
    }

    /// Run a query along an already made decision
    ///
    /// Falls back along [`Strategy::fallback`] when a path cannot run at all,
    /// e.g. the cache entry vanished after the decision was made.
    pub async fn execute_with_decision(
        &self,
        request: QueryRequest,
        decision: StrategyDecision,
    ) -> EngineResult<QueryResponse> {
        let started = Instant::now();
        let key = CacheKey::from(decision.cache_key.as_str());
        let learned_estimate = self.graph.sample_count(&request.analysis.query_type)
            >= self.graph.min_samples() as u64;

        let (request_ref, key_ref) = (&request, &key);
        let (strategy, outcome) = run_with_fallback(&request.query_id, decision.strategy, move |strategy| {
            self.run_strategy(strategy, request_ref, key_ref)
        })
        .await?;

        let confidences = self.aggregator.configured_confidences(&outcome.layers);
        let result = self
            .aggregator
            .merge_expecting(&outcome.per_source, &confidences, &outcome.layers);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.observe(&request, &decision, strategy, learned_estimate, &outcome, &result, latency_ms);
        if strategy != Strategy::Cache {
            self.maybe_populate_cache(&request.analysis, &key, &outcome, &result);
        }

        info!(
            query_id = %request.query_id,
            query_type = %request.analysis.query_type,
            strategy = %strategy,
            status = ?result.status,
            items = result.items.len(),
            latency_ms,
            "Query executed"
        );

        Ok(QueryResponse {
            query_id: request.query_id,
            decision,
            executed_strategy: strategy,
            result,
            cache_hit: outcome.cache_hit,
            latency_ms,
            layer_latencies: outcome.layer_latencies,
        })
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        request: &QueryRequest,
        key: &CacheKey,
    ) -> Result<PathOutcome, PathFailure> {
        let layers = &request.analysis.required_layers;
        match strategy {
            Strategy::Cache => {
                let hit = self.cache.get(key).ok_or(PathFailure::CacheMiss)?;
                let per_source = hit
                    .entry
                    .aggregate_result
                    .into_iter()
                    .map(|(source, records)| (source, SourceResult::Records(records)))
                    .collect();
                Ok(PathOutcome {
                    per_source,
                    layers: hit.entry.layers_included,
                    layer_latencies: BTreeMap::new(),
                    cache_hit: true,
                })
            }
            Strategy::Sequential => {
                let started = Instant::now();
                let mut results = Vec::with_capacity(layers.len());
                for layer in layers {
                    let task = request.task_for(layer);
                    let remaining = remaining(request.deadline, started);
                    let mut batch = self
                        .pool
                        .submit_batch_with_deadline(vec![task], remaining)
                        .await
                        .map_err(PathFailure::Rejected)?;
                    results.append(&mut batch);
                }
                Ok(PathOutcome::from_results(layers, results))
            }
            Strategy::Parallel => {
                let tasks = layers.iter().map(|layer| request.task_for(layer)).collect();
                let results = self
                    .pool
                    .submit_batch_with_deadline(tasks, request.deadline)
                    .await
                    .map_err(PathFailure::Rejected)?;
                Ok(PathOutcome::from_results(layers, results))
            }
            Strategy::Distributed => {
                let started = Instant::now();
                // Waves larger than the live pool would only queue
                let wave_size = self.pool.target_workers().max(1);
                let mut results = Vec::with_capacity(layers.len());
                for (wave, chunk) in layers.chunks(wave_size).enumerate() {
                    debug!(query_id = %request.query_id, wave, layers = chunk.len(), "Dispatching wave");
                    let tasks = chunk.iter().map(|layer| request.task_for(layer)).collect();
                    let mut batch = self
                        .pool
                        .submit_batch_with_deadline(tasks, remaining(request.deadline, started))
                        .await
                        .map_err(PathFailure::Rejected)?;
                    results.append(&mut batch);
                }
                Ok(PathOutcome::from_results(layers, results))
            }
        }
    }

    /// Cache a fresh, complete result when the graph says the query type is worth it
    fn maybe_populate_cache(
        &self,
        analysis: &QueryAnalysis,
        key: &CacheKey,
        outcome: &PathOutcome,
        result: &AggregateResult,
    ) {
        if !analysis.cacheable || !result.missing_sources.is_empty() {
            return;
        }
        let worthy = self
            .graph
            .recommend(&analysis.query_type)
            .ready()
            .is_some_and(|rec| rec.is_cache_worthy);
        if !worthy {
            return;
        }

        self.cache
            .put(key.clone(), outcome.layers.clone(), outcome.successful_payloads(), None);
        debug!(query_type = %analysis.query_type, cache_key = %key, "Cached query result");
    }

    /// Feed the outcome back into profiler, graph and telemetry
    fn observe(
        &self,
        request: &QueryRequest,
        decision: &StrategyDecision,
        executed: Strategy,
        learned_estimate: bool,
        outcome: &PathOutcome,
        result: &AggregateResult,
        latency_ms: f64,
    ) {
        let success = result.missing_sources.is_empty();
        let memory_bytes = serde_json::to_vec(result).map(|v| v.len()).unwrap_or(0);

        let mut metrics = QueryMetrics::new(
            request.query_id.clone(),
            request.analysis.query_type.clone(),
            outcome
                .layer_latencies
                .iter()
                .map(|(layer, ms)| (layer.clone(), *ms)),
        )
        .with_latency(latency_ms)
        .with_success(success)
        .with_cache_hit(outcome.cache_hit);
        metrics.query_text = request.query_text.clone();
        metrics.layers_queried = outcome.layers.clone();
        metrics.result_count = result.items.len();
        metrics.memory_mb = memory_bytes as f64 / (1024.0 * 1024.0);

        // Cache hits say nothing about layer latency
        if !outcome.cache_hit {
            self.graph.observe(&metrics);
        }
        self.profiler.record(metrics);

        self.telemetry.record(ExecutionTelemetry {
            query_id: request.query_id.clone(),
            query_type: request.analysis.query_type.clone(),
            strategy_chosen: decision.strategy,
            strategy_confidence: decision.confidence,
            estimated_latency_ms: decision.estimated_latency_ms,
            learned_estimate,
            total_latency_ms: latency_ms,
            success: success && executed == decision.strategy,
            layers_queried: outcome.layers.clone(),
            recorded_at: self.clock.now(),
        });

        let executed_count = self.executed.fetch_add(1, Ordering::AcqRel) + 1;
        if executed_count % self.config.telemetry.recalibrate_every == 0 {
            self.recalibrate();
        }
    }

    /// Apply telemetry gathered since the last recalibration
    ///
    /// The selector gets per-strategy confidence multipliers; the graph gets a
    /// per-query-type latency correction pooled over the executed strategies.
    pub fn recalibrate(&self) -> Vec<Calibration> {
        let calibration = self.telemetry.take_calibration();
        self.selector.recalibrate(&calibration);

        let mut pooled: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for c in calibration.iter().filter(|c| c.strategy != Strategy::Cache) {
            // Only estimates built from graph data say anything about the graph
            if let Some(bias) = c.learned_latency_bias {
                let entry = pooled.entry(c.query_type.as_str()).or_insert((0.0, 0));
                entry.0 += bias * c.learned_samples as f64;
                entry.1 += c.learned_samples;
            }
        }
        for (query_type, (weighted_bias, samples)) in pooled {
            if samples == 0 {
                continue;
            }
            let bias = weighted_bias / samples as f64;
            if (bias - 1.0).abs() < MIN_CORRECTION_DELTA {
                continue;
            }
            let corrected = self.graph.latency_correction(query_type) * bias;
            self.graph.apply_latency_correction(query_type, corrected);
        }

        debug!(groups = calibration.len(), "Recalibrated from telemetry");
        calibration
    }

    /// Start the pool's load balancer and the periodic expiry sweep; idempotent
    pub fn start_background_tasks(&self) {
        self.pool.start_balancer();

        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let telemetry = Arc::clone(&self.telemetry);
        let token = self.shutdown.clone();
        *maintenance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        let pruned = telemetry.prune_expired();
                        if purged + pruned > 0 {
                            debug!(purged, pruned, "Maintenance sweep");
                        }
                    }
                }
            }
        }));
        info!("Background tasks started");
    }

    /// Stop background work and the worker pool
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.pool.shutdown().await;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Arc<PerformanceProfiler> {
        &self.profiler
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn cache(&self) -> &Arc<CrossLayerCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn selector(&self) -> &Arc<StrategySelector> {
        &self.selector
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    /// Queries executed since construction
    pub fn executed_count(&self) -> usize {
        self.executed.load(Ordering::Acquire)
    }
}

/// Run `strategy`, walking [`Strategy::fallback`] while a path cannot run at all
async fn run_with_fallback<T, F, Fut>(query_id: &str, mut strategy: Strategy, mut run: F) -> EngineResult<(Strategy, T)>
where
    F: FnMut(Strategy) -> Fut,
    Fut: Future<Output = Result<T, PathFailure>>,
{
    loop {
        let failure = match run(strategy).await {
            Ok(outcome) => return Ok((strategy, outcome)),
            Err(failure) => failure,
        };

        let fallback = strategy.fallback();
        if fallback == strategy {
            return Err(match failure {
                PathFailure::Rejected(err) => err,
                PathFailure::CacheMiss => EngineError::invalid_operation("no execution path available"),
            });
        }
        match &failure {
            PathFailure::CacheMiss => debug!(query_id = %query_id, "Cache entry vanished before use"),
            PathFailure::Rejected(err) => {
                warn!(query_id = %query_id, strategy = %strategy, fallback = %fallback, error = %err, "Strategy failed")
            }
        }
        strategy = fallback;
    }
}

fn remaining(deadline: Option<Duration>, started: Instant) -> Option<Duration> {
    deadline.map(|d| d.saturating_sub(started.elapsed()))
}
