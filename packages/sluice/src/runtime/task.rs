// process bookkeeping for the worker pool.
//
// a process is a boxed future plus its scheduling state. waking a process pushes it onto the
// run queue exactly once: the `queued` bit dedups wakes, and is cleared just before the
// worker polls, so a wake arriving mid-poll re-queues the task rather than getting lost. the
// future slot is locked for the duration of a poll, so a task woken onto another worker
// mid-poll waits there until the first poll finishes.

use std::{
    any::Any,
    collections::VecDeque,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{
            AtomicBool,
            Ordering::{AcqRel, Release},
        },
        Arc, Condvar, Mutex,
    },
    task::{Context, Poll, Wake, Waker},
};

pub(crate) type ProcFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// shared run queue feeding the worker pool.
pub(crate) struct RunQueue {
    ready: Mutex<ReadyState>,
    // signalled when a task is pushed or shutdown begins.
    available: Condvar,
}

struct ReadyState {
    queue: VecDeque<Arc<Task>>,
    shutdown: bool,
}

impl RunQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RunQueue {
            ready: Mutex::new(ReadyState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        })
    }

    // enqueue a runnable task. returns false if the pool has shut down, in which case the
    // task is dropped on the floor.
    pub(crate) fn push(&self, task: Arc<Task>) -> bool {
        let mut ready = self.ready.lock().unwrap();
        if ready.shutdown {
            return false;
        }
        ready.queue.push_back(task);
        drop(ready);
        self.available.notify_one();
        true
    }

    // block until a task is runnable. `None` once the pool shuts down; tasks still queued at
    // that point are dropped, not run.
    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        let mut ready = self.ready.lock().unwrap();
        loop {
            if ready.shutdown {
                return None;
            }
            if let Some(task) = ready.queue.pop_front() {
                return Some(task);
            }
            ready = self.available.wait(ready).unwrap();
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut ready = self.ready.lock().unwrap();
        ready.shutdown = true;
        ready.queue.clear();
        drop(ready);
        self.available.notify_all();
    }
}

// one spawned process.
pub(crate) struct Task {
    // the process body. `None` once it has finished or panicked. held locked while a worker
    // polls, which also serializes concurrent runs of the same task.
    future: Mutex<Option<ProcFuture>>,
    // whether the task already sits in the run queue.
    queued: AtomicBool,
    queue: Arc<RunQueue>,
}

impl Task {
    // build a task and queue it for its first poll. returns false if the pool has shut down.
    pub(crate) fn spawn(queue: &Arc<RunQueue>, future: ProcFuture) -> bool {
        let task = Arc::new(Task {
            future: Mutex::new(Some(future)),
            // born queued; the push below is the matching enqueue
            queued: AtomicBool::new(true),
            queue: Arc::clone(queue),
        });
        queue.push(task)
    }

    // poll the process once. panics in the process body are caught here so a bad process
    // cannot take its worker thread down with it.
    pub(crate) fn run(self: &Arc<Self>) {
        let mut slot = self.future.lock().unwrap();
        self.queued.store(false, Release);
        let Some(future) = slot.as_mut() else {
            return;
        };

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => *slot = None,
            Ok(Poll::Pending) => (),
            Err(payload) => {
                *slot = None;
                error!(panic = panic_message(payload.as_ref()), "process panicked");
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        if !self.queued.swap(true, AcqRel) {
            let queue = Arc::clone(&self.queue);
            queue.push(self);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
