//! Timeout channels.
//!
//! [`after`] hands out a channel that closes at a deadline. Because it is an ordinary
//! channel, a timeout composes with everything else: take from it to sleep, put it in a
//! select to bound a wait. One lazily started service thread drives every outstanding
//! deadline for the process.

use crate::channel::api::Channel;
use std::{
    collections::BTreeMap,
    sync::{Condvar, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

/// A channel that closes once `delay` has elapsed.
///
/// The channel never carries a message; its only event is the close, which every taker and
/// every select branch observes as the `None` sentinel. A zero (or already elapsed) delay
/// returns the channel pre-closed, so a take on it resolves immediately. A delay too large
/// for the platform clock never fires. Dropping every handle and pending take releases the
/// deadline entry on the service's next pass, without waiting for it to elapse.
pub fn after(delay: Duration) -> Channel<()> {
    let chan = Channel::rendezvous();
    if delay.is_zero() {
        chan.close();
        return chan;
    }
    match Instant::now().checked_add(delay) {
        Some(deadline) => {
            if deadline <= Instant::now() {
                chan.close();
            } else {
                service().register(deadline, chan.clone());
            }
        }
        // unrepresentable deadline; the channel simply never closes
        None => (),
    }
    chan
}

static SERVICE: OnceLock<&'static TimerService> = OnceLock::new();

fn service() -> &'static TimerService {
    SERVICE.get_or_init(|| {
        debug!("starting timer service");
        let service: &'static TimerService = Box::leak(Box::new(TimerService {
            state: Mutex::new(TimerState {
                deadlines: BTreeMap::new(),
                next_seq: 0,
            }),
            tick: Condvar::new(),
        }));
        thread::Builder::new()
            .name("sluice-timer".to_owned())
            .spawn(move || run_loop(service))
            .expect("failed to spawn timer thread");
        service
    })
}

struct TimerService {
    state: Mutex<TimerState>,
    // signalled when a new deadline may precede the one being slept on
    tick: Condvar,
}

struct TimerState {
    // pending deadlines, ordered. the sequence number keeps equal instants distinct.
    deadlines: BTreeMap<(Instant, u64), Channel<()>>,
    next_seq: u64,
}

impl TimerService {
    fn register(&self, deadline: Instant, chan: Channel<()>) {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.deadlines.insert((deadline, seq), chan);
        drop(state);
        self.tick.notify_one();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.state.lock().unwrap().deadlines.len()
    }
}

fn run_loop(service: &'static TimerService) {
    let mut due: Vec<Channel<()>> = Vec::new();
    let mut state = service.state.lock().unwrap();
    loop {
        // reclaim entries nobody can observe anymore: every outside handle and pending take
        // on the channel has been dropped, so the close would go unseen
        state
            .deadlines
            .retain(|_, chan| chan.inner().handle_count() > 1);

        let now = Instant::now();
        while let Some((&key, _)) = state.deadlines.first_key_value() {
            if key.0 > now {
                break;
            }
            let (_, chan) = state.deadlines.pop_first().expect("internal bug: empty map");
            due.push(chan);
        }

        // close outside the service lock, so the wakes this triggers never contend with
        // registrations
        if !due.is_empty() {
            drop(state);
            for chan in due.drain(..) {
                trace!("timeout fired");
                chan.close();
            }
            state = service.state.lock().unwrap();
            continue;
        }

        let next = state.deadlines.keys().next().map(|&(deadline, _)| deadline);
        state = match next {
            None => service.tick.wait(state).unwrap(),
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                service.tick.wait_timeout(state, wait).unwrap().0
            }
        };
    }
}
