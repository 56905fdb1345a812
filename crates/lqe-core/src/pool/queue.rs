//! Priority Task Queue
//!
//! Higher priority pops first; equal priorities pop in submission order.

use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::types::{TaskPriority, WorkerTask, WorkerTaskResult};

/// A task waiting for a worker, with its completion channel
pub(crate) struct QueuedTask {
    pub task: WorkerTask,
    pub reply: oneshot::Sender<WorkerTaskResult>,
    pub cancel: CancellationToken,
    pub enqueued_at: Instant,
    seq: u64,
}

impl QueuedTask {
    fn key(&self) -> (TaskPriority, Reverse<u64>) {
        (self.task.priority, Reverse(self.seq))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Enqueue a task and return the receiver its result will arrive on
    pub fn push(&self, task: WorkerTask, cancel: CancellationToken) -> oneshot::Receiver<WorkerTaskResult> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedTask {
                task,
                reply,
                cancel,
                enqueued_at: Instant::now(),
                seq,
            });
        }
        self.available.notify_one();
        rx
    }

    pub fn pop(&self) -> Option<QueuedTask> {
        self.state.lock().heap.pop()
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Resolves when a task may be available
    pub async fn notified(&self) {
        self.available.notified().await
    }

    /// Wake every idle worker
    pub fn wake_all(&self) {
        self.available.notify_waiters();
    }

    /// Drop every queued task; their callers observe a closed channel
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.heap.len();
        state.heap.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, priority: TaskPriority) -> WorkerTask {
        WorkerTask::new(name, "noop").with_priority(priority)
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = TaskQueue::new();
        let token = CancellationToken::new();
        let _rx: Vec<_> = [
            task("low", TaskPriority::Low),
            task("medium-1", TaskPriority::Medium),
            task("high-1", TaskPriority::High),
            task("medium-2", TaskPriority::Medium),
            task("high-2", TaskPriority::High),
        ]
        .into_iter()
        .map(|t| queue.push(t, token.clone()))
        .collect();

        assert_eq!(queue.len(), 5);
        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|q| q.task.layer_name)
            .collect();
        assert_eq!(order, vec!["high-1", "high-2", "medium-1", "medium-2", "low"]);
    }

    #[test]
    fn test_clear_closes_channels() {
        let queue = TaskQueue::new();
        let mut rx = queue.push(task("a", TaskPriority::Low), CancellationToken::new());
        assert_eq!(queue.clear(), 1);
        assert!(rx.try_recv().is_err());
        assert!(queue.pop().is_none());
    }
}
