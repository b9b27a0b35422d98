//! Bounded-concurrency task runner for replication work.
//!
//! Tasks are infallible futures; a task that fails internally reports through
//! its own side effects (the replicator routes errors to the dispatcher), so
//! the queue itself never rejects and never aborts.
//!
//! Workers pop from the *tail* of the queue - tasks added later run first.
//! The doclog observer relies on this: it reverses remote deltas so the
//! newest entries are considered first, and per-id dedup upstream means each
//! surviving entry runs exactly once.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// A unit of replication work.
pub type Task = BoxFuture<'static, ()>;

type StepFn = dyn Fn(usize, usize) + Send + Sync;
type EndFn = dyn Fn() + Send + Sync;

pub const DEFAULT_CONCURRENCY: usize = 8;

struct QueueState {
    queue: Vec<Task>,
    running: usize,
    total: usize,
    complete: usize,
}

struct QueueInner {
    concurrency: usize,
    state: Mutex<QueueState>,
    on_step: Option<Box<StepFn>>,
    on_end: Option<Box<EndFn>>,
    idle_tx: watch::Sender<bool>,
    idle_rx: watch::Receiver<bool>,
}

/// FIFO-admission, LIFO-execution task queue running up to `concurrency`
/// tasks at a time.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(
        concurrency: usize,
        on_step: Option<Box<StepFn>>,
        on_end: Option<Box<EndFn>>,
    ) -> Self {
        let (idle_tx, idle_rx) = watch::channel(true);
        Self {
            inner: Arc::new(QueueInner {
                concurrency: concurrency.max(1),
                state: Mutex::new(QueueState {
                    queue: Vec::new(),
                    running: 0,
                    total: 0,
                    complete: 0,
                }),
                on_step,
                on_end,
                idle_tx,
                idle_rx,
            }),
        }
    }

    /// Atomically append tasks and top up workers to the concurrency bound.
    pub async fn add(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().await;
        state.total += tasks.len();
        state.queue.extend(tasks);
        let _ = self.inner.idle_tx.send(false);

        let spawnable = self
            .inner
            .concurrency
            .saturating_sub(state.running)
            .min(state.queue.len());
        for _ in 0..spawnable {
            state.running += 1;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(run_worker(inner));
        }
    }

    /// Resolve once the queue is empty and no task is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle_rx.clone();
        // The sender lives as long as the queue, so this cannot fail while
        // `self` is alive.
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Snapshot of `(complete, total)` for the current burst.
    pub async fn progress(&self) -> (usize, usize) {
        let state = self.inner.state.lock().await;
        (state.complete, state.total)
    }
}

async fn run_worker(inner: Arc<QueueInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock().await;
            match state.queue.pop() {
                Some(task) => task,
                None => {
                    state.running -= 1;
                    if state.running == 0 {
                        // Drained: reset counters so the next burst reports
                        // progress from zero.
                        state.total = 0;
                        state.complete = 0;
                        if let Some(end) = &inner.on_end {
                            end();
                        }
                        let _ = inner.idle_tx.send(true);
                    }
                    return;
                }
            }
        };

        task.await;

        let mut state = inner.state.lock().await;
        state.complete += 1;
        if let Some(step) = &inner.on_step {
            step(state.complete, state.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn noop_queue(concurrency: usize) -> TaskQueue {
        TaskQueue::new(concurrency, None, None)
    }

    #[tokio::test]
    async fn test_runs_all_tasks() {
        let queue = noop_queue(4);
        let count = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task> = (0..20)
            .map(|_| {
                let count = Arc::clone(&count);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as Task
            })
            .collect();

        queue.add(tasks).await;
        queue.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_bounded_concurrency_and_monotonic_steps() {
        let steps = Arc::new(StdMutex::new(Vec::new()));
        let steps_cb = Arc::clone(&steps);
        let queue = TaskQueue::new(
            8,
            Some(Box::new(move |complete, total| {
                steps_cb.lock().unwrap().push((complete, total));
            })),
            None,
        );

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task> = (0..100)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }) as Task
            })
            .collect();

        queue.add(tasks).await;
        queue.wait_idle().await;

        assert!(max_in_flight.load(Ordering::SeqCst) <= 8);

        let steps = steps.lock().unwrap();
        assert_eq!(steps.len(), 100);
        for (i, (complete, total)) in steps.iter().enumerate() {
            assert_eq!(*complete, i + 1, "current must be strictly monotonic");
            assert_eq!(*total, 100);
        }
    }

    #[tokio::test]
    async fn test_lifo_execution_with_single_worker() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let queue = noop_queue(1);

        let tasks: Vec<Task> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                }) as Task
            })
            .collect();

        queue.add(tasks).await;
        queue.wait_idle().await;

        // Tasks added later run first.
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_on_end_fires_once_per_drain() {
        let ends = Arc::new(AtomicUsize::new(0));
        let ends_cb = Arc::clone(&ends);
        let queue = TaskQueue::new(
            2,
            None,
            Some(Box::new(move || {
                ends_cb.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let tasks: Vec<Task> = (0..5).map(|_| Box::pin(async {}) as Task).collect();
        queue.add(tasks).await;
        queue.wait_idle().await;
        assert_eq!(ends.load(Ordering::SeqCst), 1);

        // Counters reset between bursts.
        assert_eq!(queue.progress().await, (0, 0));

        let tasks: Vec<Task> = (0..2).map(|_| Box::pin(async {}) as Task).collect();
        queue.add(tasks).await;
        queue.wait_idle().await;
        assert_eq!(ends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_add_while_running_extends_total() {
        let steps = Arc::new(StdMutex::new(Vec::new()));
        let steps_cb = Arc::clone(&steps);
        let queue = TaskQueue::new(
            1,
            Some(Box::new(move |complete, total| {
                steps_cb.lock().unwrap().push((complete, total));
            })),
            None,
        );

        let queue2 = queue.clone();
        let first: Task = Box::pin(async move {
            let late: Vec<Task> = vec![Box::pin(async {}) as Task];
            queue2.add(late).await;
        });
        queue.add(vec![first]).await;
        queue.wait_idle().await;

        let steps = steps.lock().unwrap();
        assert_eq!(steps.len(), 2);
        // The second step sees the extended total.
        assert_eq!(steps[1], (2, 2));
    }
}
