//! A fixed-ish pool of workers draining a dedup-keyed task queue. Used by
//! the fleet manager to run health checks without ever running two checks
//! for the same server concurrently.

mod queue;

pub use queue::Queue;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// How long a worker waits for the "new task" signal before polling the
/// queue anyway. A missed notification (there is an inherent race between
/// "check queue, see nothing" and "signal fires") can therefore never stall
/// a worker for longer than this.
const DISPATCH_FALLBACK: Duration = Duration::from_secs(1);

/// One unit of work. The key is used purely for dedup: while a task with
/// this key is queued or executing, further `add_task` calls with the same
/// key are dropped.
pub trait Task: Send + 'static {
    fn key(&self) -> String;
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

struct Dedup {
    in_flight: Mutex<HashSet<String>>,
}

impl Dedup {
    fn new() -> Self {
        Self { in_flight: Mutex::new(HashSet::new()) }
    }

    /// Atomically test-and-insert: returns true if `key` was newly
    /// inserted (caller should enqueue), false if it was already present
    /// (caller should drop the task).
    async fn try_claim(&self, key: &str) -> bool {
        self.in_flight.lock().await.insert(key.to_string())
    }

    async fn release(&self, key: &str) {
        self.in_flight.lock().await.remove(key);
    }
}

/// A dedup-keyed worker pool. Cloning shares the same queue, dedup set,
/// and worker generation counter.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<Queue<Box<dyn Task>>>,
    dedup: Arc<Dedup>,
    new_task: Arc<Notify>,
    generation: Arc<AtomicUsize>,
    size: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Build a pool and immediately scale it to `size` workers.
    pub fn new(size: usize) -> Self {
        let pool = Self {
            queue: Arc::new(Queue::new()),
            dedup: Arc::new(Dedup::new()),
            new_task: Arc::new(Notify::new()),
            generation: Arc::new(AtomicUsize::new(0)),
            size: Arc::new(AtomicUsize::new(0)),
        };
        pool.scale(size);
        pool
    }

    /// Enqueue a task. A no-op if a task with the same key is already
    /// queued or executing.
    pub async fn add_task(&self, task: impl Task) {
        let key = task.key();
        if !self.dedup.try_claim(&key).await {
            debug!(%key, "task already queued or executing, dropping duplicate");
            return;
        }
        self.queue.push(Box::new(task));
        self.new_task.notify_one();
    }

    /// Resize the pool to `size` workers. Growing only spawns the newly
    /// added ids — workers already running under the prior generation are
    /// left alone. Shrinking bumps the generation counter so every existing
    /// worker retires the next time it would otherwise idle-wait, then
    /// spawns a fresh `size` of them under the new generation.
    pub fn scale(&self, size: usize) {
        let previous = self.size.swap(size, Ordering::SeqCst);

        if size > previous {
            let generation = self.generation.load(Ordering::SeqCst);
            for id in previous..size {
                self.spawn_worker(id, size, generation);
            }
        } else if size < previous {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            for id in 0..size {
                self.spawn_worker(id, size, generation);
            }
        }
    }

    fn spawn_worker(&self, id: usize, pool_size: usize, generation: usize) {
        let queue = self.queue.clone();
        let dedup = self.dedup.clone();
        let new_task = self.new_task.clone();
        let current_generation = self.generation.clone();

        tokio::spawn(async move {
            loop {
                if current_generation.load(Ordering::SeqCst) != generation {
                    debug!(worker = id, "pool was rescaled, retiring");
                    return;
                }
                if id >= pool_size {
                    return;
                }

                match queue.pop() {
                    Some(task) => {
                        let key = task.key();
                        dedup.release(&key).await;
                        task.run().await;
                    }
                    None => {
                        tokio::select! {
                            _ = new_task.notified() => {}
                            _ = tokio::time::sleep(DISPATCH_FALLBACK) => {}
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingTask {
        key: String,
        counter: Arc<AtomicU32>,
    }

    impl Task for CountingTask {
        fn key(&self) -> String {
            self.key.clone()
        }

        fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async move {
                self.counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn runs_a_single_task() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        pool.add_task(CountingTask { key: "a".into(), counter: counter.clone() }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_keys_collapse_while_queued() {
        let pool = WorkerPool::new(0);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            pool.add_task(CountingTask { key: "dup".into(), counter: counter.clone() }).await;
        }

        pool.scale(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_key_runs_again_once_prior_run_started() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));

        pool.add_task(CountingTask { key: "k".into(), counter: counter.clone() }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.add_task(CountingTask { key: "k".into(), counter: counter.clone() }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn growing_the_pool_does_not_bump_the_generation() {
        let pool = WorkerPool::new(1);
        let before = pool.generation.load(Ordering::SeqCst);

        pool.scale(3);
        let after = pool.generation.load(Ordering::SeqCst);

        assert_eq!(before, after, "pure growth must not retire already-running workers");
    }

    #[tokio::test]
    async fn growing_the_pool_leaves_existing_workers_able_to_finish_their_task() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));

        pool.add_task(CountingTask { key: "a".into(), counter: counter.clone() }).await;
        pool.scale(4);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shrinking_the_pool_bumps_the_generation() {
        let pool = WorkerPool::new(3);
        let before = pool.generation.load(Ordering::SeqCst);

        pool.scale(1);
        let after = pool.generation.load(Ordering::SeqCst);

        assert!(after > before, "shrinking must retire workers outside the new range");
    }
}
