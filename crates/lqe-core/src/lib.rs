//! lqe-core - Adaptive query execution for layered memory stores
//!
//! This crate decides, per query, how to fan a request out across memory
//! layers and learns from every execution to decide better next time:
//!
//! - **profiler**: Per-query latency, memory and cache-hit samples
//! - **graph**: Learned layer co-occurrence, latency and per-type advice
//! - **cache**: TTL-aware LRU cache of aggregated multi-layer results
//! - **pool**: Self-resizing worker pool with priorities, timeouts and deadlines
//! - **selector**: CACHE / PARALLEL / DISTRIBUTED / SEQUENTIAL selection
//! - **aggregator**: Confidence-weighted, deterministic result merging
//! - **telemetry**: Estimate accuracy and strategy effectiveness feedback
//! - **engine**: Execution context wiring all of the above together

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod pool;
pub mod profiler;
pub mod scoring;
pub mod selector;
pub mod telemetry;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use aggregator::{AggregateResult, AggregateStatus, MergedItem, ResultAggregator, SourceResult};
pub use cache::{CacheKey, CacheStats, CrossLayerCache, CrossLayerCacheEntry};
pub use config::{ConfigValidationError, EngineConfig};
pub use engine::{ExecutionEngine, QueryRequest, QueryResponse, query_fn_name};
pub use error::{EngineError, EngineResult};
pub use graph::{DependencyGraph, LayerDependency, QueryPattern, Recommendation};
pub use pool::{LayerQueryFn, PoolStats, QueryFnRegistry, WorkerPool};
pub use profiler::{PerformanceProfiler, QueryStats};
pub use selector::StrategySelector;
pub use telemetry::{Calibration, StrategyEffectiveness, TelemetryCollector};
pub use types::{
    ExecutionTelemetry, LayerPayload, LayerRecord, QueryAnalysis, QueryMetrics, SourceConfidence, Strategy,
    StrategyDecision, TaskError, TaskPriority, WorkerTask, WorkerTaskResult,
};
