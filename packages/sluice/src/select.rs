//! Racing several channel operations, committing exactly one.
//!
//! [`Select`] collects puts and takes, possibly on different channels, plus an optional
//! timeout. [`Select::begin`] links every branch into its channel under one shared commit
//! flag, and the first branch able to complete claims the flag and wins. The losers are
//! cancelled without side effects: no message moves, no waiter is left behind, even on a
//! rendezvous channel, because a hand-off claims both sides' flags atomically or not at all.
//!
//! Tie-break is deterministic and documented: every poll scans the branches in declaration
//! order, so when several are ready at once the earliest-declared branch wins, and the
//! timeout is checked last. The timeout is itself just a take on a channel that closes at the
//! deadline (see [`crate::timer::after`]), so it obeys the same commit discipline; a timeout
//! of zero makes that channel start closed, which guarantees an immediate, non-parking
//! resolution when no other branch is ready.

use crate::{
    channel::{
        api::Channel,
        core,
        error::PutError,
        flag::Flag,
        polling::{self, Timeout},
    },
    timer,
};
use smallvec::SmallVec;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

/// Builder for a selection over channel operations.
///
/// All branches carry the same message type. Branches are raced in declaration order; see the
/// module docs for the tie-break rules.
pub struct Select<T> {
    branches: SmallVec<[Branch<T>; 4]>,
    timeout: Option<Duration>,
}

enum Branch<T> {
    Take(Channel<T>),
    Put(Channel<T>, T),
}

impl<T> Select<T> {
    pub fn new() -> Self {
        Select {
            branches: SmallVec::new(),
            timeout: None,
        }
    }

    /// Add a take branch.
    pub fn take(mut self, chan: &Channel<T>) -> Self {
        self.branches.push(Branch::Take(chan.clone()));
        self
    }

    /// Add a put branch. If the branch loses, `msg` is dropped with it.
    pub fn put(mut self, chan: &Channel<T>, msg: T) -> Self {
        self.branches.push(Branch::Put(chan.clone(), msg));
        self
    }

    /// Give up after `timeout` if no branch has committed. A zero timeout resolves to
    /// [`Selected::TimedOut`] on the first poll unless some branch is ready immediately.
    /// Calling this again replaces the previous timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Link every branch into its channel and start the race.
    ///
    /// Panics if the select has no branches and no timeout; such a select could never
    /// resolve.
    pub fn begin(self) -> SelectFut<T> {
        assert!(
            !self.branches.is_empty() || self.timeout.is_some(),
            "select with no branches and no timeout",
        );
        let flag = Flag::new();
        let mut ops: SmallVec<[OpState<T>; 4]> = self
            .branches
            .into_iter()
            .map(|branch| match branch {
                Branch::Take(chan) => OpState::Take(chan.inner().take(Arc::clone(&flag))),
                Branch::Put(chan, msg) => {
                    OpState::Put(chan.inner().put(Arc::clone(&flag), msg))
                }
            })
            .collect();
        if let Some(timeout) = self.timeout {
            let deadline = timer::after(timeout);
            ops.push(OpState::Timeout(deadline.inner().take(Arc::clone(&flag))));
        }
        SelectFut { ops, done: false }
    }
}

impl<T> Default for Select<T> {
    fn default() -> Self {
        Select::new()
    }
}

/// The committed branch of a select.
#[derive(Debug)]
pub enum Selected<T> {
    /// A take branch committed.
    Take {
        /// Position of the branch in declaration order.
        index: usize,
        /// The message, or `None` if the branch's channel was closed and drained.
        msg: Option<T>,
    },
    /// A put branch committed, by delivering or by failing against a closed channel.
    Put {
        /// Position of the branch in declaration order.
        index: usize,
        /// `Err` gives the message back if the channel closed.
        result: Result<(), PutError<T>>,
    },
    /// No branch committed before the timeout.
    TimedOut,
}

/// Future for [`Select::begin`].
///
/// Resolves to the one committed branch. Dropping it cancels every branch that has not
/// resolved, abandoning the whole select without side effects.
pub struct SelectFut<T> {
    ops: SmallVec<[OpState<T>; 4]>,
    done: bool,
}

enum OpState<T> {
    Put(core::Put<T>),
    Take(core::Take<T>),
    // the timeout branch: a take on a channel that closes at the deadline
    Timeout(core::Take<()>),
    // resolved, lost, or cancelled; skipped on later polls
    Spent,
}

// outcome of polling one branch.
enum Verdict<T> {
    Skip,
    Parked,
    Dead,
    Won(Selected<T>),
}

impl<T> SelectFut<T> {
    /// Whether the select has resolved.
    pub fn is_terminated(&self) -> bool {
        self.done
    }

    /// Block the calling thread until one branch commits.
    ///
    /// Must not be called from a process on the worker pool; `.await` the future there
    /// instead.
    pub fn block(&mut self) -> Selected<T> {
        assert!(!self.done, "select future already resolved");
        polling::block_on(self, Timeout::Never)
            .expect("internal bug: blocking without timeout gave up")
    }

    /// Block until one branch commits or `timeout` elapses.
    ///
    /// `None` means the bridge gave up and the whole select was abandoned without side
    /// effects. This is distinct from [`Selected::TimedOut`], which is a branch of the
    /// select itself committing.
    pub fn block_timeout(&mut self, timeout: Duration) -> Option<Selected<T>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.block_deadline(deadline),
            None => Some(self.block()),
        }
    }

    /// Block until one branch commits or `deadline` passes.
    pub fn block_deadline(&mut self, deadline: Instant) -> Option<Selected<T>> {
        assert!(!self.done, "select future already resolved");
        match polling::block_on(self, Timeout::At(deadline)) {
            Some(selected) => Some(selected),
            None => {
                let harvested = self.retire_harvest();
                self.done = true;
                harvested
            }
        }
    }

    /// Commit a branch only if one is ready immediately. On `None` the whole select is
    /// abandoned without side effects.
    pub fn try_now(&mut self) -> Option<Selected<T>> {
        assert!(!self.done, "select future already resolved");
        match polling::block_on(self, Timeout::NonBlocking) {
            Some(selected) => Some(selected),
            None => {
                let harvested = self.retire_harvest();
                self.done = true;
                harvested
            }
        }
    }

    fn poll_inner(&mut self, cx: &mut Context) -> Poll<Selected<T>> {
        for i in 0..self.ops.len() {
            let mut op = std::mem::replace(&mut self.ops[i], OpState::Spent);
            let verdict = match &mut op {
                OpState::Spent => Verdict::Skip,
                OpState::Put(put) => match Pin::new(put).poll(cx) {
                    Poll::Pending => Verdict::Parked,
                    Poll::Ready(core::PutPoll::Dead) => Verdict::Dead,
                    Poll::Ready(core::PutPoll::Sent) => Verdict::Won(Selected::Put {
                        index: i,
                        result: Ok(()),
                    }),
                    Poll::Ready(core::PutPoll::Closed(msg)) => Verdict::Won(Selected::Put {
                        index: i,
                        result: Err(PutError { msg }),
                    }),
                },
                OpState::Take(take) => match Pin::new(take).poll(cx) {
                    Poll::Pending => Verdict::Parked,
                    Poll::Ready(core::TakePoll::Dead) => Verdict::Dead,
                    Poll::Ready(core::TakePoll::Msg(msg)) => Verdict::Won(Selected::Take {
                        index: i,
                        msg: Some(msg),
                    }),
                    Poll::Ready(core::TakePoll::Drained) => Verdict::Won(Selected::Take {
                        index: i,
                        msg: None,
                    }),
                },
                OpState::Timeout(take) => match Pin::new(take).poll(cx) {
                    Poll::Pending => Verdict::Parked,
                    Poll::Ready(core::TakePoll::Dead) => Verdict::Dead,
                    // the deadline channel closed (it never carries messages)
                    Poll::Ready(_) => Verdict::Won(Selected::TimedOut),
                },
            };
            match verdict {
                Verdict::Parked => self.ops[i] = op,
                // a dead branch stays spent; the sibling that claimed the flag reports the
                // result when its turn comes
                Verdict::Skip | Verdict::Dead => (),
                Verdict::Won(selected) => {
                    self.retire_all();
                    self.done = true;
                    return Poll::Ready(selected);
                }
            }
        }
        Poll::Pending
    }

    // cancel every branch that has not resolved. messages held by losing puts are dropped.
    fn retire_all(&mut self) {
        for op in self.ops.iter_mut() {
            match std::mem::replace(op, OpState::Spent) {
                OpState::Spent => (),
                OpState::Put(mut put) => {
                    put.cancel();
                }
                OpState::Take(mut take) => {
                    take.cancel();
                }
                OpState::Timeout(mut take) => {
                    take.cancel();
                }
            }
        }
    }

    // like `retire_all`, but for giving up: a counterparty may have committed a branch in
    // the instant before its cancel, and that commit must be surfaced, not discarded. at
    // most one branch can be in that state, since a commit claims the shared flag.
    fn retire_harvest(&mut self) -> Option<Selected<T>> {
        let mut won = None;
        for (i, op) in self.ops.iter_mut().enumerate() {
            match std::mem::replace(op, OpState::Spent) {
                OpState::Spent => (),
                OpState::Put(mut put) => {
                    if let core::PutCancel::Delivered = put.cancel() {
                        won = Some(Selected::Put {
                            index: i,
                            result: Ok(()),
                        });
                    }
                }
                OpState::Take(mut take) => {
                    if let core::TakeCancel::Delivered(msg) = take.cancel() {
                        won = Some(Selected::Take {
                            index: i,
                            msg: Some(msg),
                        });
                    }
                }
                // the timer channel has no putters, so a timeout take is never completed
                // passively; plain cancel suffices
                OpState::Timeout(mut take) => {
                    take.cancel();
                }
            }
        }
        won
    }
}

impl<T> Future for SelectFut<T> {
    type Output = Selected<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        this.poll_inner(cx)
    }
}

#[cfg(feature = "futures")]
impl<T> futures::future::FusedFuture for SelectFut<T> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Drop for SelectFut<T> {
    fn drop(&mut self) {
        if !self.done {
            self.retire_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::error::{TryPutCause, TryTakeError};
    use std::{thread, time::Instant};

    const LONG: Duration = Duration::from_secs(5);
    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn ready_branch_wins_without_touching_others() {
        let quiet = Channel::rendezvous();
        let ready = Channel::bounded(1);
        ready.put(7u32).try_now().unwrap();

        let selected = Select::new().take(&quiet).take(&ready).begin().block();
        match selected {
            Selected::Take { index, msg } => {
                assert_eq!(index, 1);
                assert_eq!(msg, Some(7));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // the losing branch left no taker behind: a put into the quiet channel still parks
        let err = quiet.put(9u32).try_now().unwrap_err();
        assert_eq!(err.cause, TryPutCause::Full);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let a = Channel::bounded(1);
        let b = Channel::bounded(1);
        a.put(1u32).try_now().unwrap();
        b.put(2u32).try_now().unwrap();

        match Select::new().take(&a).take(&b).begin().block() {
            Selected::Take { index: 0, msg } => assert_eq!(msg, Some(1)),
            other => panic!("unexpected: {other:?}"),
        }
        match Select::new().take(&b).take(&a).begin().block() {
            Selected::Take { index: 0, msg } => assert_eq!(msg, Some(2)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_resolves_immediately() {
        let chan = Channel::<u32>::rendezvous();
        let start = Instant::now();
        let selected = Select::new()
            .take(&chan)
            .timeout(Duration::ZERO)
            .begin()
            .block();
        assert!(matches!(selected, Selected::TimedOut));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn ready_branch_beats_zero_timeout() {
        let chan = Channel::bounded(1);
        chan.put(3u32).try_now().unwrap();
        let selected = Select::new()
            .take(&chan)
            .timeout(Duration::ZERO)
            .begin()
            .block();
        match selected {
            Selected::Take { index: 0, msg } => assert_eq!(msg, Some(3)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn put_on_closed_channel_commits_with_error() {
        let closed = Channel::bounded(1);
        closed.close();
        let open = Channel::rendezvous();

        let selected = Select::new().put(&closed, 5u32).take(&open).begin().block();
        match selected {
            Selected::Put { index: 0, result } => assert_eq!(result.unwrap_err().msg, 5),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parked_select_commits_when_a_branch_readies() {
        let a = Channel::<u32>::rendezvous();
        let b = Channel::<u32>::rendezvous();

        let a_2 = a.clone();
        let b_2 = b.clone();
        let racer = thread::spawn(move || Select::new().take(&a_2).take(&b_2).begin().block());
        thread::sleep(SHORT);
        b.put(11).block_timeout(LONG).unwrap();

        match racer.join().unwrap() {
            Selected::Take { index, msg } => {
                assert_eq!(index, 1);
                assert_eq!(msg, Some(11));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // the abandoned branch left no taker on `a`
        assert_eq!(a.put(1).try_now().unwrap_err().cause, TryPutCause::Full);
    }

    #[test]
    fn put_branch_commits_into_open_buffer() {
        let full = Channel::rendezvous();
        let roomy = Channel::bounded(1);

        let selected = Select::new()
            .put(&full, 1u32)
            .put(&roomy, 2u32)
            .begin()
            .block();
        match selected {
            Selected::Put { index, result } => {
                assert_eq!(index, 1);
                result.unwrap();
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(roomy.take().try_now().unwrap(), Some(2));
        // the losing put left nothing parked on the rendezvous channel
        assert_eq!(full.take().try_now().unwrap_err(), TryTakeError);
    }

    #[test]
    fn select_does_not_pair_with_itself() {
        // a put and a take on the same rendezvous channel in one select must not complete
        // each other; with nobody else around, only the timeout can fire
        let chan = Channel::rendezvous();
        let selected = Select::new()
            .put(&chan, 1u32)
            .take(&chan)
            .timeout(SHORT)
            .begin()
            .block();
        assert!(matches!(selected, Selected::TimedOut));
    }

    #[test]
    fn block_timeout_abandons_quiet_select() {
        let a = Channel::<u32>::rendezvous();
        let b = Channel::<u32>::rendezvous();
        let start = Instant::now();
        let selected = Select::new()
            .take(&a)
            .take(&b)
            .begin()
            .block_timeout(Duration::from_millis(30));
        assert!(selected.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
        // both branches were unlinked on the way out
        assert_eq!(a.put(1).try_now().unwrap_err().cause, TryPutCause::Full);
        assert_eq!(b.put(2).try_now().unwrap_err().cause, TryPutCause::Full);
    }

    #[test]
    fn dropped_select_leaves_no_waiters() {
        let chan = Channel::<u32>::rendezvous();
        let fut = Select::new().take(&chan).begin();
        drop(fut);
        // no ghost taker: a put still refuses to complete immediately
        assert_eq!(chan.put(1).try_now().unwrap_err().cause, TryPutCause::Full);
    }

    #[test]
    fn take_on_closed_branch_commits_with_sentinel() {
        let closed = Channel::<u32>::bounded(1);
        closed.close();
        let open = Channel::<u32>::rendezvous();

        let selected = Select::new().take(&open).take(&closed).begin().block();
        match selected {
            Selected::Take { index, msg } => {
                assert_eq!(index, 1);
                assert_eq!(msg, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
