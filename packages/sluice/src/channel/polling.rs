// blocking bridge for channel futures.
//
// design based on the pollster crate: poll the future on the current thread, and when it
// pends, sleep on a condvar until the waker fires. extended with deadline and non-blocking
// modes. the signal outlives any wakers still held by waiter nodes, because they own it
// through an `Arc`; a waker that fires after the bridge has given up just flips a state bit
// nobody is watching.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};

// timeout for blocking on a future.
#[derive(Copy, Clone)]
pub(crate) enum Timeout {
    // block until the future resolves.
    Never,
    // give up at the deadline.
    At(Instant),
    // poll exactly once and never sleep.
    NonBlocking,
}

// block the current thread on a future. returns `None` if the timeout elapsed first, in which
// case the caller is expected to cancel the operation.
pub(crate) fn block_on<F>(fut: &mut F, timeout: Timeout) -> Option<F::Output>
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    loop {
        if let Poll::Ready(out) = Pin::new(&mut *fut).poll(&mut cx) {
            return Some(out);
        }

        let mut state = signal.state.lock().unwrap();
        if let State::Notified = *state {
            // woken between the poll and the lock; poll again
            *state = State::Empty;
            continue;
        }
        *state = State::Waiting;
        match timeout {
            Timeout::Never => {
                while let State::Waiting = *state {
                    state = signal.cond.wait(state).unwrap();
                }
            }
            Timeout::At(deadline) => {
                while let State::Waiting = *state {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return None;
                    };
                    let (next, result) = signal.cond.wait_timeout(state, remaining).unwrap();
                    state = next;
                    if result.timed_out() {
                        return None;
                    }
                }
            }
            Timeout::NonBlocking => return None,
        }
        *state = State::Empty;
    }
}

struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

enum State {
    Empty,
    Waiting,
    Notified,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Notified => (),
            State::Empty => *state = State::Notified,
            State::Waiting => {
                *state = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}
