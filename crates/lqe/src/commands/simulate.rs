//! Simulated workload command.
//!
//! Builds an engine over the simulated layers, replays a random workload
//! through it and reports which strategies were chosen, how often the chosen
//! path had to fall back, and what telemetry learned along the way.

use anyhow::{Context, Result};
use colored::Colorize;
use futures::StreamExt;
use lqe_core::cache::CacheStats;
use lqe_core::{
    EngineConfig, ExecutionEngine, PoolStats, QueryFnRegistry, QueryResponse, QueryStats, Strategy,
    StrategyEffectiveness,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cli::SimulateArgs;
use crate::error::CliError;
use crate::sim::Simulation;

#[derive(Debug, Default, Clone, Serialize)]
struct StrategyTally {
    selected: usize,
    executed: usize,
    fell_back: usize,
    total_latency_ms: f64,
}

impl StrategyTally {
    fn mean_latency_ms(&self) -> f64 {
        if self.executed == 0 {
            0.0
        } else {
            self.total_latency_ms / self.executed as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CalibrationEntry {
    query_type: String,
    strategy: Strategy,
    multiplier: f64,
}

#[derive(Debug, Serialize)]
struct Report {
    queries: usize,
    errors: usize,
    partial: usize,
    cache_hits: usize,
    wall_time_ms: f64,
    strategies: BTreeMap<Strategy, StrategyTally>,
    query_types: Vec<QueryStats>,
    effectiveness: Vec<StrategyEffectiveness>,
    calibration: Vec<CalibrationEntry>,
    cache: CacheStats,
    pool: PoolStats,
}

pub async fn execute(args: SimulateArgs, config: EngineConfig) -> Result<()> {
    let report = run(&args, config).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn validate(args: &SimulateArgs) -> Result<(), CliError> {
    if args.queries == 0 {
        return Err(CliError::invalid_argument("queries", "must be greater than 0"));
    }
    if args.concurrency == 0 {
        return Err(CliError::invalid_argument("concurrency", "must be greater than 0"));
    }
    if !(0.0..=1.0).contains(&args.failure_rate) {
        return Err(CliError::invalid_argument("failure-rate", "must be within [0, 1]"));
    }
    if !(0.0..=1.0).contains(&args.repeat_ratio) {
        return Err(CliError::invalid_argument("repeat-ratio", "must be within [0, 1]"));
    }
    if args.layer_timeout_ms == 0 {
        return Err(CliError::invalid_argument("layer-timeout-ms", "must be greater than 0"));
    }
    Ok(())
}

async fn run(args: &SimulateArgs, config: EngineConfig) -> Result<Report> {
    validate(args)?;

    let engine = ExecutionEngine::new(config, Arc::new(QueryFnRegistry::new()))
        .context("Failed to start execution engine")?;
    engine.start_background_tasks();

    let sim = Simulation::new(args.seed, args.failure_rate);
    sim.register(&engine);

    let mut history = Vec::new();
    let layer_timeout = Duration::from_millis(args.layer_timeout_ms);
    let requests: Vec<_> = (0..args.queries)
        .map(|_| {
            sim.next_request(&mut history, args.repeat_ratio)
                .with_layer_timeout(layer_timeout)
        })
        .collect();

    tracing::info!(
        queries = args.queries,
        concurrency = args.concurrency,
        seed = ?args.seed,
        "Starting simulation"
    );

    let started = Instant::now();
    let responses: Vec<_> = futures::stream::iter(requests)
        .map(|request| engine.execute(request))
        .buffered(args.concurrency)
        .collect()
        .await;
    let wall_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut report = Report {
        queries: args.queries,
        errors: 0,
        partial: 0,
        cache_hits: 0,
        wall_time_ms,
        strategies: BTreeMap::new(),
        query_types: Vec::new(),
        effectiveness: Vec::new(),
        calibration: Vec::new(),
        cache: engine.cache().stats(),
        pool: engine.pool().stats(),
    };

    for response in responses {
        match response {
            Ok(response) => {
                if args.verbose {
                    print_response(&response);
                }
                tally(&mut report, &response);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query failed");
                report.errors += 1;
            }
        }
    }

    report.query_types = engine
        .profiler()
        .query_types()
        .iter()
        .filter_map(|qt| engine.profiler().stats_for(qt))
        .collect();
    report.effectiveness = Strategy::ALL
        .iter()
        .filter_map(|s| engine.telemetry().strategy_effectiveness(*s))
        .collect();
    report.calibration = engine
        .selector()
        .calibration_snapshot()
        .into_iter()
        .map(|(query_type, strategy, multiplier)| CalibrationEntry {
            query_type,
            strategy,
            multiplier,
        })
        .collect();

    engine.shutdown().await;
    Ok(report)
}

fn tally(report: &mut Report, response: &QueryResponse) {
    report
        .strategies
        .entry(response.decision.strategy)
        .or_default()
        .selected += 1;

    let executed = report.strategies.entry(response.executed_strategy).or_default();
    executed.executed += 1;
    executed.total_latency_ms += response.latency_ms;
    if response.fell_back() {
        executed.fell_back += 1;
    }

    if response.cache_hit {
        report.cache_hits += 1;
    }
    if response.result.is_partial() {
        report.partial += 1;
    }
}

fn print_response(response: &QueryResponse) {
    let strategy = match response.executed_strategy {
        Strategy::Cache => response.executed_strategy.as_str().green(),
        Strategy::Parallel => response.executed_strategy.as_str().cyan(),
        Strategy::Distributed => response.executed_strategy.as_str().magenta(),
        Strategy::Sequential => response.executed_strategy.as_str().normal(),
    };
    let mut line = format!(
        "  {:<12} {:<8} conf {:.2}  {:>7.1}ms  {} items",
        strategy,
        &response.query_id[..8.min(response.query_id.len())],
        response.decision.confidence,
        response.latency_ms,
        response.result.items.len()
    );
    if response.fell_back() {
        line.push_str(&format!(" {}", format!("(fell back from {})", response.decision.strategy).yellow()));
    }
    if response.result.is_partial() {
        line.push_str(&format!(" {}", format!("(missing {})", response.result.missing_sources.join(", ")).red()));
    }
    println!("{}", line);
}

fn print_report(report: &Report) {
    println!();
    println!("{}", "Simulation Report".cyan().bold());
    println!("{}", "─".repeat(60));
    println!(
        "  Queries: {}  Errors: {}  Partial: {}  Cache hits: {}  Wall time: {:.0}ms",
        report.queries, report.errors, report.partial, report.cache_hits, report.wall_time_ms
    );

    println!();
    println!("{}", "Strategies".bold());
    println!(
        "  {:<12} {:>8} {:>8} {:>9} {:>10}",
        "strategy", "selected", "executed", "fell back", "mean ms"
    );
    for (strategy, tally) in &report.strategies {
        println!(
            "  {:<12} {:>8} {:>8} {:>9} {:>10.1}",
            strategy.as_str(),
            tally.selected,
            tally.executed,
            tally.fell_back,
            tally.mean_latency_ms()
        );
    }

    println!();
    println!("{}", "Query types".bold());
    for stats in &report.query_types {
        println!(
            "  {:<12} n={:<4} p50 {:>7.1}ms  p95 {:>7.1}ms  success {:>5.1}%  cached {:>5.1}%",
            stats.query_type,
            stats.count,
            stats.p50_latency_ms,
            stats.p95_latency_ms,
            stats.success_rate * 100.0,
            stats.cache_hit_rate * 100.0
        );
    }

    if !report.effectiveness.is_empty() {
        println!();
        println!("{}", "Estimate accuracy".bold());
        for eff in &report.effectiveness {
            println!(
                "  {:<12} runs {:<4} success {:>5.1}%  bias {:>+7.1}ms  |err| {:>6.1}ms",
                eff.strategy.as_str(),
                eff.executions,
                eff.success_rate * 100.0,
                eff.avg_latency_error_ms,
                eff.mean_abs_latency_error_ms
            );
        }
    }

    if !report.calibration.is_empty() {
        println!();
        println!("{}", "Calibration".bold());
        for entry in &report.calibration {
            println!(
                "  {:<12} {:<12} x{:.3}",
                entry.query_type,
                entry.strategy.as_str(),
                entry.multiplier
            );
        }
    }

    println!();
    println!(
        "  Cache: {} entries, hit rate {:.1}%, {} evictions, {} expired",
        report.cache.size,
        report.cache.hit_rate() * 100.0,
        report.cache.evictions,
        report.cache.expired
    );
    println!(
        "  Pool: {} workers, {} completed, {} failed, {} timed out",
        report.pool.live_workers, report.pool.completed, report.pool.failed, report.pool.timed_out
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(queries: usize) -> SimulateArgs {
        SimulateArgs {
            queries,
            concurrency: 2,
            seed: Some(11),
            failure_rate: 0.0,
            repeat_ratio: 0.5,
            layer_timeout_ms: 2000,
            verbose: false,
            json: true,
        }
    }

    #[test]
    fn test_rejects_out_of_range_rates() {
        let mut bad = args(10);
        bad.failure_rate = 1.5;
        assert_eq!(
            validate(&bad),
            Err(CliError::invalid_argument("failure-rate", "must be within [0, 1]"))
        );

        let mut bad = args(10);
        bad.concurrency = 0;
        assert!(validate(&bad).is_err());
        assert!(validate(&args(0)).is_err());
    }

    #[tokio::test]
    async fn test_run_accounts_for_every_query() {
        let report = run(&args(12), EngineConfig::default()).await.unwrap();

        assert_eq!(report.errors, 0);
        let selected: usize = report.strategies.values().map(|t| t.selected).sum();
        let executed: usize = report.strategies.values().map(|t| t.executed).sum();
        assert_eq!(selected, 12);
        assert_eq!(executed, 12);
        let profiled: usize = report.query_types.iter().map(|s| s.count).sum();
        assert_eq!(profiled, 12);
    }
}
