//! Worker Pool
//!
//! Executes [`WorkerTask`]s on a bounded, self-resizing set of Tokio workers.
//!
//! - Dispatch order is priority first, then submission order.
//! - Each task runs under its own timeout. A timeout, error or panic becomes a
//!   failed [`WorkerTaskResult`] for that task only.
//! - Every submitted batch returns exactly one result per task, in submission
//!   order. A caller-level deadline cancels whatever is still unfinished.
//! - A load balancer adjusts the live worker count on its own interval.
//!   Workers retire only between tasks, so resizing never drops queued work.

mod balancer;
mod queue;
mod registry;

pub use balancer::{LoadSample, ScaleDecision, ScalingPolicy, ThroughputWindow};
pub use registry::{FnQuery, LayerQueryFn, QueryFnRegistry};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{LayerPayload, TaskError, WorkerTask, WorkerTaskResult};
use queue::{QueuedTask, TaskQueue};

/// Idle workers re-check for retirement at least this often
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Point-in-time pool counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub live_workers: usize,
    pub target_workers: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub observed_qps: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────────────────

struct PoolShared {
    config: PoolConfig,
    policy: ScalingPolicy,
    registry: Arc<QueryFnRegistry>,
    queue: TaskQueue,
    shutdown: CancellationToken,
    closed: AtomicBool,
    live_workers: AtomicUsize,
    target_workers: AtomicUsize,
    in_flight: AtomicUsize,
    next_worker_id: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    throughput: Mutex<ThroughputWindow>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    /// Claim a retirement slot if the pool is above its target
    fn try_retire(&self) -> bool {
        let mut live = self.live_workers.load(Ordering::Acquire);
        loop {
            if live <= self.target_workers.load(Ordering::Acquire) {
                return false;
            }
            match self.live_workers.compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => live = actual,
            }
        }
    }

    /// Spawn workers until the live count reaches the target
    fn spawn_to_target(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());

        while self.live_workers.load(Ordering::Acquire) < self.target_workers.load(Ordering::Acquire) {
            self.live_workers.fetch_add(1, Ordering::AcqRel);
            let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::clone(self);
            workers.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
    }

    fn set_target(self: &Arc<Self>, target: usize) {
        let target = target.clamp(self.config.min_workers, self.config.max_workers);
        self.target_workers.store(target, Ordering::Release);
        self.spawn_to_target();
        // Idle workers above target notice on wake-up
        self.queue.wake_all();
    }

    fn observed_qps(&self) -> f64 {
        self.throughput.lock().qps(Instant::now())
    }

    fn rebalance(self: &Arc<Self>) -> ScaleDecision {
        let sample = LoadSample {
            current_workers: self.target_workers.load(Ordering::Acquire),
            observed_qps: self.observed_qps(),
            queue_depth: self.queue.len(),
        };
        let decision = self.policy.decide(sample);
        match decision {
            ScaleDecision::Grow(target) | ScaleDecision::Shrink(target) => {
                info!(
                    from = sample.current_workers,
                    to = target,
                    qps = sample.observed_qps,
                    queued = sample.queue_depth,
                    "Resizing worker pool"
                );
                self.set_target(target);
            }
            ScaleDecision::Hold => {}
        }
        decision
    }

    async fn execute(&self, job: QueuedTask) {
        let QueuedTask {
            task,
            reply,
            cancel,
            enqueued_at,
            ..
        } = job;

        // Caller already gave up
        if cancel.is_cancelled() || reply.is_closed() {
            return;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        debug!(
            task_id = %task.task_id,
            layer = %task.layer_name,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "Dispatching task"
        );

        let started = Instant::now();
        let outcome = self.run_layer_call(&task, &cancel).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        match &outcome {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                if err.is_timeout() {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task.task_id, layer = %task.layer_name, error = %err, "Task failed");
            }
        }
        self.throughput.lock().record(Instant::now());

        let _ = reply.send(WorkerTaskResult {
            task_id: task.task_id,
            layer_name: task.layer_name,
            outcome,
            latency_ms,
        });
    }

    async fn run_layer_call(&self, task: &WorkerTask, cancel: &CancellationToken) -> Result<LayerPayload, TaskError> {
        let function = self
            .registry
            .resolve(&task.query_fn_name)
            .ok_or_else(|| TaskError::UnknownQueryFunction(task.query_fn_name.clone()))?;

        // The ceiling caps the task's own timeout and counts from dispatch
        let ceiling = Duration::from_millis(self.config.hard_ceiling_ms);
        let (limit, expired) = if task.timeout <= ceiling {
            (task.timeout, TaskError::TimedOut(task.timeout.as_millis() as u64))
        } else {
            (ceiling, TaskError::ForceFailed(self.config.hard_ceiling_ms))
        };

        let args = task.args.clone();
        let kwargs = task.kwargs.clone();
        // Own task so a panic surfaces as a JoinError instead of killing the worker
        let handle = tokio::spawn(async move { function.call(args, kwargs).await });
        let abort = handle.abort_handle();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                Err(TaskError::Cancelled)
            }
            joined = tokio::time::timeout(limit, handle) => match joined {
                Err(_) => {
                    abort.abort();
                    if matches!(expired, TaskError::ForceFailed(_)) {
                        warn!(task_id = %task.task_id, ceiling_ms = self.config.hard_ceiling_ms, "Task force-failed");
                    }
                    Err(expired)
                }
                Ok(Err(join_err)) if join_err.is_panic() => {
                    Err(TaskError::Panicked(panic_message(join_err.into_panic())))
                }
                Ok(Err(_)) => Err(TaskError::Cancelled),
                Ok(Ok(Err(err))) => Err(TaskError::Failed(format!("{:#}", err))),
                Ok(Ok(Ok(payload))) => Ok(payload),
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    loop {
        if shared.shutdown.is_cancelled() {
            shared.live_workers.fetch_sub(1, Ordering::AcqRel);
            break;
        }
        if shared.try_retire() {
            break;
        }

        match shared.queue.pop() {
            Some(job) => shared.execute(job).await,
            None => {
                tokio::select! {
                    _ = shared.queue.notified() => {}
                    _ = shared.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Pool
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded pool of workers executing layer calls
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    balancer: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with `min_workers` live workers
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig, registry: Arc<QueryFnRegistry>) -> EngineResult<Self> {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::invalid_operation("worker pool requires a Tokio runtime"))?;

        let window = Duration::from_secs(config.qps_window_secs.max(1));
        let shared = Arc::new(PoolShared {
            policy: ScalingPolicy::new(&config),
            registry,
            queue: TaskQueue::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            target_workers: AtomicUsize::new(config.min_workers),
            in_flight: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            throughput: Mutex::new(ThroughputWindow::new(window)),
            workers: Mutex::new(Vec::new()),
            config,
        });
        shared.spawn_to_target();

        info!(
            min_workers = shared.config.min_workers,
            max_workers = shared.config.max_workers,
            target_qps = shared.config.target_qps,
            "Worker pool started"
        );

        Ok(Self {
            shared,
            balancer: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<QueryFnRegistry> {
        &self.shared.registry
    }

    /// Start the periodic load balancer; idempotent
    pub fn start_balancer(&self) {
        let mut balancer = self.balancer.lock();
        if balancer.is_some() || self.is_shut_down() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let period = Duration::from_millis(shared.config.rebalance_interval_ms.max(1));
        *balancer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        shared.rebalance();
                    }
                }
            }
        }));
    }

    /// Run one balancing step immediately
    pub fn rebalance_now(&self) -> ScaleDecision {
        self.shared.rebalance()
    }

    /// Submit one task and wait for its result
    pub async fn submit(&self, task: WorkerTask) -> EngineResult<WorkerTaskResult> {
        self.ensure_open()?;
        let token = self.shared.shutdown.child_token();
        let rx = self.shared.queue.push(task.clone(), token.clone());
        Ok(self.await_result(task, rx, token).await)
    }

    /// Submit tasks and wait for all of them
    ///
    /// Results are in submission order, one per task.
    pub async fn submit_batch(&self, tasks: Vec<WorkerTask>) -> EngineResult<Vec<WorkerTaskResult>> {
        self.submit_batch_with_deadline(tasks, None).await
    }

    /// Like [`submit_batch`](Self::submit_batch), cancelling unfinished tasks at `deadline`
    ///
    /// Tasks that completed before the deadline keep their results; the rest
    /// are reported as [`TaskError::Cancelled`].
    pub async fn submit_batch_with_deadline(
        &self,
        tasks: Vec<WorkerTask>,
        deadline: Option<Duration>,
    ) -> EngineResult<Vec<WorkerTaskResult>> {
        self.ensure_open()?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let batch_token = self.shared.shutdown.child_token();
        let pending: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let token = batch_token.child_token();
                let rx = self.shared.queue.push(task.clone(), token.clone());
                (task, rx, token)
            })
            .collect();

        let timer = deadline.map(|deadline| {
            let token = batch_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                debug!(deadline_ms = deadline.as_millis() as u64, "Batch deadline reached");
                token.cancel();
            })
        });

        let results = join_all(
            pending
                .into_iter()
                .map(|(task, rx, token)| self.await_result(task, rx, token)),
        )
        .await;

        if let Some(timer) = timer {
            timer.abort();
        }
        Ok(results)
    }

    async fn await_result(
        &self,
        task: WorkerTask,
        mut rx: oneshot::Receiver<WorkerTaskResult>,
        token: CancellationToken,
    ) -> WorkerTaskResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_secs_f64() * 1000.0;

        // Timeouts and the hard ceiling are enforced by the worker once the
        // task is dispatched; a queued task only ends early through its token.
        tokio::select! {
            biased;
            received = &mut rx => match received {
                Ok(result) => result,
                Err(_) if token.is_cancelled() => WorkerTaskResult::failed(&task, TaskError::Cancelled, elapsed_ms()),
                Err(_) => WorkerTaskResult::failed(
                    &task,
                    TaskError::Failed("task dropped before completion".to_string()),
                    elapsed_ms(),
                ),
            },
            _ = token.cancelled() => {
                WorkerTaskResult::failed(&task, TaskError::Cancelled, elapsed_ms())
            }
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_shut_down() {
            Err(EngineError::PoolShutdown)
        } else {
            Ok(())
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Worker count the pool is currently sized to
    pub fn target_workers(&self) -> usize {
        self.shared.target_workers.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            live_workers: shared.live_workers.load(Ordering::Acquire),
            target_workers: shared.target_workers.load(Ordering::Acquire),
            queued: shared.queue.len(),
            in_flight: shared.in_flight.load(Ordering::Acquire),
            completed: shared.completed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            timed_out: shared.timed_out.load(Ordering::Relaxed),
            observed_qps: shared.observed_qps(),
        }
    }

    /// Stop accepting work, cancel in-flight tasks and wait for workers to exit
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.cancel();
        let dropped = self.shared.queue.clear();
        self.shared.queue.wake_all();

        if let Some(balancer) = self.balancer.lock().take() {
            balancer.abort();
        }
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        info!(dropped_tasks = dropped, "Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.shutdown.cancel();
    }
}
