// parked-operation queues.
//
// each channel keeps two of these, one for parked puts and one for parked takes. owners hold a
// token rather than a pointer into the queue, and every access goes through the channel's one
// mutex, so there is no unsafe intrusive linking anywhere. a node stays queued until its owner
// removes it; counterparties that complete an operation passively just mark the node done and
// wake it, and the owner collects the result on its next poll.
//
// a node whose flag is decided but which is not done belongs to a losing select branch that has
// not been cancelled yet. scans skip such nodes but never remove them, because for a parked put
// the node slot still holds the caller's message and only the owner may reclaim it.

use super::flag::{claim_pair, Flag, PairClaim};
use smallvec::SmallVec;
use std::{collections::VecDeque, sync::Arc, task::Waker};

// identifies one waiter within one queue.
pub(crate) type Token = u64;

// one parked operation.
pub(crate) struct Waiter<T> {
    token: Token,
    // commit flag of the owning operation.
    pub(crate) flag: Arc<Flag>,
    // waker from the owner's most recent poll, if any.
    pub(crate) waker: Option<Waker>,
    // for a parked put: the message waiting to be delivered.
    // for a parked take: empty until a hand-off fills it.
    pub(crate) slot: Option<T>,
    // set when a counterparty completes this operation passively.
    pub(crate) done: bool,
}

impl<T> Waiter<T> {
    // mark done and steal the waker for the caller to invoke once the channel unlocks.
    pub(crate) fn complete(&mut self) -> Option<Waker> {
        self.done = true;
        self.waker.take()
    }
}

// outcome of scanning for a live counterparty to pair with.
pub(crate) enum Claim<'a, T> {
    // both flags claimed. the waiter is now ours to complete.
    Won(&'a mut Waiter<T>),
    // our own flag was decided by a sibling select branch.
    OursDead,
    // no live counterparty is parked.
    None,
}

// FIFO queue of parked operations for one direction of one channel.
pub(crate) struct WaiterQueue<T> {
    waiters: VecDeque<Waiter<T>>,
    next_token: Token,
}

impl<T> WaiterQueue<T> {
    pub(crate) fn new() -> Self {
        WaiterQueue {
            waiters: VecDeque::new(),
            next_token: 0,
        }
    }

    // park an operation at the back of the queue.
    pub(crate) fn enqueue(&mut self, flag: Arc<Flag>, slot: Option<T>) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        self.waiters.push_back(Waiter {
            token,
            flag,
            waker: None,
            slot,
            done: false,
        });
        token
    }

    // owner-side lookup.
    pub(crate) fn waiter_mut(&mut self, token: Token) -> Option<&mut Waiter<T>> {
        self.waiters.iter_mut().find(|w| w.token == token)
    }

    // owner-side removal. returns the node so the owner can reclaim its slot.
    pub(crate) fn remove(&mut self, token: Token) -> Option<Waiter<T>> {
        let idx = self.waiters.iter().position(|w| w.token == token)?;
        self.waiters.remove(idx)
    }

    // whether this token is the first waiter still contending, skipping nodes that are done or
    // whose select was decided elsewhere. FIFO fairness: only the front waiter may resolve.
    pub(crate) fn is_front(&self, token: Token) -> bool {
        for w in &self.waiters {
            if w.done || w.flag.is_decided() {
                continue;
            }
            return w.token == token;
        }
        false
    }

    // wake the first waiter still contending. its waker is consumed; the next poll reinstalls it.
    pub(crate) fn wake_front(&mut self) -> Option<Waker> {
        self.waiters
            .iter_mut()
            .find(|w| !w.done && !w.flag.is_decided())
            .and_then(|w| w.waker.take())
    }

    // scan from the front for a live counterparty and claim its flag together with `ours`.
    pub(crate) fn claim_front(&mut self, ours: &Arc<Flag>) -> Claim<'_, T> {
        for w in self.waiters.iter_mut() {
            if w.done {
                continue;
            }
            match claim_pair(ours, &w.flag) {
                PairClaim::Won => return Claim::Won(w),
                PairClaim::OursDead => return Claim::OursDead,
                PairClaim::TheirsDead => continue,
            }
        }
        Claim::None
    }

    // scan from the front for a live waiter and claim its flag alone. used to pull parked puts
    // into freed buffer space, where our own operation has already committed.
    pub(crate) fn claim_front_solo(&mut self) -> Option<&mut Waiter<T>> {
        self.waiters
            .iter_mut()
            .filter(|w| !w.done)
            .find(|w| w.flag.try_claim())
    }

    // steal every parked waker. used by close, which wakes the whole queue so that each owner
    // can observe the closed channel on its next poll.
    pub(crate) fn take_all_wakers(&mut self, out: &mut SmallVec<[Waker; 8]>) {
        for w in self.waiters.iter_mut() {
            if let Some(waker) = w.waker.take() {
                out.push(waker);
            }
        }
    }
}
