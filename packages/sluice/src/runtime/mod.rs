//! The worker pool: many lightweight processes multiplexed over a few OS threads.
//!
//! A process is any future; it suspends only at channel operations (timeouts included, since
//! a timeout is a take on a timer channel). A fixed set of worker threads polls runnable
//! processes from one FIFO run queue. A process parked on a channel occupies no worker until
//! the channel wakes it, so the number of in-flight processes is bounded by memory, not by
//! threads.
//!
//! Two rules keep a pool healthy:
//!
//! - never call the blocking adjuncts ([`block`](crate::PutFut::block) and friends) from
//!   inside a process; they would pin the worker thread. `.await` the same futures instead.
//! - put genuinely blocking work (file IO, long computation, foreign calls) on a dedicated
//!   OS thread via [`thread`], which lives outside the pool and may block freely.

mod task;

use self::task::{RunQueue, Task};
use crate::channel::api::Channel;
use std::{
    future::Future,
    sync::{Arc, Mutex, OnceLock},
    thread::JoinHandle,
};

// fallback when the platform will not report its parallelism.
const DEFAULT_WORKERS: usize = 4;

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(DEFAULT_WORKERS)
}

/// A fixed pool of worker threads running spawned processes.
///
/// Dropping the runtime shuts it down: workers are joined and processes that never got to
/// run are dropped.
pub struct Runtime {
    queue: Arc<RunQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Configuration for [`Runtime`].
pub struct RuntimeBuilder {
    workers: Option<usize>,
    thread_name: String,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        RuntimeBuilder {
            workers: None,
            thread_name: "sluice-worker".to_owned(),
        }
    }

    /// Number of worker threads. Defaults to the available parallelism.
    pub fn workers(mut self, count: usize) -> Self {
        assert!(count > 0, "worker pool needs at least one thread");
        self.workers = Some(count);
        self
    }

    /// Prefix for worker thread names.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Runtime {
        let count = self.workers.unwrap_or_else(default_workers);
        let queue = RunQueue::new();
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let queue = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{i}", self.thread_name))
                .spawn(move || worker_loop(queue))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        info!(workers = count, "started worker pool");
        Runtime {
            queue,
            workers: Mutex::new(workers),
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder::new()
    }
}

fn worker_loop(queue: Arc<RunQueue>) {
    while let Some(task) = queue.pop() {
        task.run();
    }
    trace!("worker exiting");
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Spawn a process onto the pool.
    ///
    /// Returns a capacity-1 channel that receives the process's output and then closes. If
    /// the process panics, or the pool shuts down before it runs, the channel just closes;
    /// a take on it then resolves to `None`.
    pub fn spawn<F>(&self, proc: F) -> Channel<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let done = Channel::bounded(1);
        let result = done.clone();
        let guard = CloseOnDrop(done);
        let accepted = Task::spawn(
            &self.queue,
            Box::pin(async move {
                let out = proc.await;
                // capacity 1 and we hold the only putting side, so this does not park; if
                // the caller closed the result channel early the output is simply dropped
                let _ = guard.0.put(out).await;
            }),
        );
        if !accepted {
            debug!("process spawned after shutdown; dropped");
        }
        result
    }

    /// Shut the pool down and join its workers. Idempotent.
    ///
    /// Processes still waiting for their first run, and wakes arriving afterwards, are
    /// dropped; their result channels close without delivering. Must not be called from a
    /// worker.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// closes the result channel whichever way the process ends: normal delivery, a panic
// unwinding the future, or the future being dropped without ever running.
struct CloseOnDrop<T>(Channel<T>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Spawn a process on the global pool, starting the pool on first use.
///
/// The global pool uses the default [`RuntimeBuilder`] settings and is never shut down.
pub fn spawn<F>(proc: F) -> Channel<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    GLOBAL.get_or_init(|| RuntimeBuilder::new().build()).spawn(proc)
}

/// Run a blocking closure on its own OS thread, outside any pool.
///
/// This is the escape hatch for work that genuinely blocks. The closure may use the blocking
/// channel adjuncts freely; delivery works like [`Runtime::spawn`], through a capacity-1
/// result channel that closes after the output (or on panic).
pub fn thread<F, T>(f: F) -> Channel<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let done = Channel::bounded(1);
    let result = done.clone();
    std::thread::Builder::new()
        .name("sluice-thread".to_owned())
        .spawn(move || {
            let guard = CloseOnDrop(done);
            let out = f();
            let _ = guard.0.put(out).block();
        })
        .expect("failed to spawn thread");
    result
}
