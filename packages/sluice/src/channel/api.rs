// the exposed channel API. a convenience wrapper around core that maps the engine's poll
// outcomes onto public result types and adds the blocking adjuncts.

use super::{
    buffer::OverflowPolicy,
    core,
    error::{
        PutError, PutTimeoutError, TakeTimeoutError, TryPutCause, TryPutError, TryTakeError,
    },
    flag::Flag,
    polling::{self, Timeout},
};
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

/// A CSP channel carrying messages of type `T`.
///
/// A channel is a FIFO conveyance with a fixed capacity, an overflow policy, and a closed
/// flag. Clones are handles onto the same channel; dropping handles never closes it, only
/// [`close`](Channel::close) does.
///
/// Puts and takes are futures. Awaiting them parks the calling process; the blocking adjuncts
/// ([`block`](PutFut::block), [`try_now`](PutFut::try_now), and friends) park the calling OS
/// thread instead and belong outside the worker pool.
pub struct Channel<T> {
    core: core::Channel<T>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            core: self.core.clone(),
            capacity: self.capacity,
            policy: self.policy,
        }
    }
}

impl<T> Debug for Channel<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T> Channel<T> {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Channel {
            core: core::Channel::new(capacity, policy),
            capacity,
            policy,
        }
    }

    /// Construct a capacity-0 channel.
    ///
    /// Nothing is ever buffered: every put completes by meeting a take, so a completed
    /// rendezvous proves both sides reached the exchange.
    pub fn rendezvous() -> Self {
        Channel::new(0, OverflowPolicy::Park)
    }

    /// Construct a channel buffering up to `capacity` messages, parking puts beyond that.
    ///
    /// `bounded(0)` is [`rendezvous`](Channel::rendezvous).
    pub fn bounded(capacity: usize) -> Self {
        Channel::new(capacity, OverflowPolicy::Park)
    }

    /// Construct a channel that evicts its oldest buffered message when full.
    ///
    /// Puts never park. Panics if `capacity` is 0; a dropping buffer needs at least one slot.
    pub fn drop_oldest(capacity: usize) -> Self {
        assert!(capacity > 0, "drop_oldest needs capacity of at least 1");
        Channel::new(capacity, OverflowPolicy::DropOldest)
    }

    /// Construct a channel that discards the incoming message when full.
    ///
    /// Puts never park. Panics if `capacity` is 0; a dropping buffer needs at least one slot.
    pub fn drop_newest(capacity: usize) -> Self {
        assert!(capacity > 0, "drop_newest needs capacity of at least 1");
        Channel::new(capacity, OverflowPolicy::DropNewest)
    }

    /// Buffer capacity. 0 for rendezvous channels.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// What happens to puts when the buffer is full.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Number of messages currently buffered. Always 0 for rendezvous channels.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Whether the buffer is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the channel has been closed. A closed channel may still hold buffered messages;
    /// takes drain them before resolving to `None`.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Whether two handles refer to the same channel.
    pub fn same_channel(&self, other: &Self) -> bool {
        self.core.same_channel(&other.core)
    }

    /// Begin putting a message into the channel.
    ///
    /// The future resolves to `Ok(())` once the message is buffered, handed to a taker, or
    /// dropped by the overflow policy (which still counts as delivered). It parks while the
    /// channel is full under [`OverflowPolicy::Park`], or while a rendezvous channel has no
    /// taker. If the channel closes first it resolves to [`PutError`], giving the message
    /// back. Dropping the future rescinds the put.
    pub fn put(&self, msg: T) -> PutFut<T> {
        if self.core.is_closed() {
            // skip the lock; the solo flag still claims on resolve
            return PutFut(core::Put::closed(Flag::new(), msg));
        }
        PutFut(self.core.put(Flag::new(), msg))
    }

    /// Begin taking a message from the channel.
    ///
    /// The future resolves to `Some(msg)`, or to `None` once the channel is closed and its
    /// buffer has been drained. It parks while the channel is open and empty. Dropping the
    /// future aborts the take.
    pub fn take(&self) -> TakeFut<T> {
        TakeFut(self.core.take(Flag::new()))
    }

    /// Close the channel. Idempotent; returns whether this call closed it.
    ///
    /// Parked and future puts fail with [`PutError`]. Takes keep draining the buffer, then
    /// resolve to `None` forever.
    pub fn close(&self) -> bool {
        self.core.close()
    }

    pub(crate) fn inner(&self) -> &core::Channel<T> {
        &self.core
    }
}

fn map_put_poll<T>(poll: core::PutPoll<T>) -> Result<(), PutError<T>> {
    match poll {
        core::PutPoll::Sent => Ok(()),
        core::PutPoll::Closed(msg) => Err(PutError { msg }),
        core::PutPoll::Dead => unreachable!("internal bug: solo put lost its flag"),
    }
}

fn map_take_poll<T>(poll: core::TakePoll<T>) -> Option<T> {
    match poll {
        core::TakePoll::Msg(msg) => Some(msg),
        core::TakePoll::Drained => None,
        core::TakePoll::Dead => unreachable!("internal bug: solo take lost its flag"),
    }
}

/// Future for [`Channel::put`].
///
/// Resolves to `Ok(())` on delivery, `Err(PutError)` if the channel closes first. Once
/// resolved, polling returns `Pending` forever and the blocking adjuncts must not be called.
///
/// The message takes its place in line when the future is created, not when it is first
/// polled. Holding an unpolled put for an extended period therefore blocks puts created
/// after it, until it resolves, is rescinded, or is drained by a take. Drop-policy channels
/// are the exception: their puts resolve regardless of position.
pub struct PutFut<T>(core::Put<T>);

impl<T> PutFut<T> {
    /// Whether the put has resolved or been rescinded.
    pub fn is_terminated(&self) -> bool {
        self.0.is_terminated()
    }

    /// Block the calling thread until the put resolves.
    ///
    /// Must not be called from a process on the worker pool; `.await` the future there
    /// instead, or move the work to [`runtime::thread`](crate::runtime::thread).
    pub fn block(&mut self) -> Result<(), PutError<T>> {
        assert!(!self.is_terminated(), "put future already resolved");
        let poll = polling::block_on(&mut self.0, Timeout::Never)
            .expect("internal bug: blocking without timeout gave up");
        map_put_poll(poll)
    }

    /// Block until the put resolves or `timeout` elapses. On timeout the put is rescinded and
    /// the message comes back in the error.
    pub fn block_timeout(&mut self, timeout: Duration) -> Result<(), PutTimeoutError<T>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.block_deadline(deadline),
            // timeout too large to represent; effectively forever
            None => self.block().map_err(PutTimeoutError::from),
        }
    }

    /// Block until the put resolves or `deadline` passes.
    pub fn block_deadline(&mut self, deadline: Instant) -> Result<(), PutTimeoutError<T>> {
        assert!(!self.is_terminated(), "put future already resolved");
        match polling::block_on(&mut self.0, Timeout::At(deadline)) {
            Some(poll) => map_put_poll(poll).map_err(PutTimeoutError::from),
            None => match self.0.cancel() {
                core::PutCancel::Refunded(msg) => Err(PutTimeoutError::TimedOut { msg }),
                // delivered in the instant between giving up and cancelling
                core::PutCancel::Delivered => Ok(()),
                core::PutCancel::Spent => {
                    unreachable!("internal bug: pending put already spent")
                }
            },
        }
    }

    /// Resolve the put only if it can complete without parking.
    pub fn try_now(&mut self) -> Result<(), TryPutError<T>> {
        assert!(!self.is_terminated(), "put future already resolved");
        match polling::block_on(&mut self.0, Timeout::NonBlocking) {
            Some(poll) => map_put_poll(poll).map_err(TryPutError::from),
            None => match self.0.cancel() {
                core::PutCancel::Refunded(msg) => Err(TryPutError {
                    msg,
                    cause: TryPutCause::Full,
                }),
                core::PutCancel::Delivered => Ok(()),
                core::PutCancel::Spent => {
                    unreachable!("internal bug: pending put already spent")
                }
            },
        }
    }

    /// Abandon the put. Returns the message if it had not been delivered yet.
    pub fn rescind(&mut self) -> Option<T> {
        match self.0.cancel() {
            core::PutCancel::Refunded(msg) => Some(msg),
            core::PutCancel::Delivered | core::PutCancel::Spent => None,
        }
    }
}

impl<T> Future for PutFut<T> {
    type Output = Result<(), PutError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.is_terminated() {
            return Poll::Pending;
        }
        Pin::new(&mut this.0).poll(cx).map(map_put_poll)
    }
}

#[cfg(feature = "futures")]
impl<T> futures::future::FusedFuture for PutFut<T> {
    fn is_terminated(&self) -> bool {
        PutFut::is_terminated(self)
    }
}

impl<T> Drop for PutFut<T> {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.rescind();
        }
    }
}

/// Future for [`Channel::take`].
///
/// Resolves to `Some(msg)`, or `None` once the channel is closed and drained. Once resolved,
/// polling returns `Pending` forever and the blocking adjuncts must not be called.
pub struct TakeFut<T>(core::Take<T>);

impl<T> TakeFut<T> {
    /// Whether the take has resolved or been aborted.
    pub fn is_terminated(&self) -> bool {
        self.0.is_terminated()
    }

    /// Block the calling thread until the take resolves.
    ///
    /// Must not be called from a process on the worker pool; `.await` the future there
    /// instead, or move the work to [`runtime::thread`](crate::runtime::thread).
    pub fn block(&mut self) -> Option<T> {
        assert!(!self.is_terminated(), "take future already resolved");
        let poll = polling::block_on(&mut self.0, Timeout::Never)
            .expect("internal bug: blocking without timeout gave up");
        map_take_poll(poll)
    }

    /// Block until the take resolves or `timeout` elapses. On timeout the take is aborted.
    pub fn block_timeout(&mut self, timeout: Duration) -> Result<Option<T>, TakeTimeoutError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.block_deadline(deadline),
            None => Ok(self.block()),
        }
    }

    /// Block until the take resolves or `deadline` passes.
    pub fn block_deadline(&mut self, deadline: Instant) -> Result<Option<T>, TakeTimeoutError> {
        assert!(!self.is_terminated(), "take future already resolved");
        match polling::block_on(&mut self.0, Timeout::At(deadline)) {
            Some(poll) => Ok(map_take_poll(poll)),
            None => match self.0.cancel() {
                core::TakeCancel::Aborted => Err(TakeTimeoutError),
                core::TakeCancel::Delivered(msg) => Ok(Some(msg)),
                core::TakeCancel::Spent => {
                    unreachable!("internal bug: pending take already spent")
                }
            },
        }
    }

    /// Resolve the take only if it can complete without parking.
    pub fn try_now(&mut self) -> Result<Option<T>, TryTakeError> {
        assert!(!self.is_terminated(), "take future already resolved");
        match polling::block_on(&mut self.0, Timeout::NonBlocking) {
            Some(poll) => Ok(map_take_poll(poll)),
            None => match self.0.cancel() {
                core::TakeCancel::Aborted => Err(TryTakeError),
                core::TakeCancel::Delivered(msg) => Ok(Some(msg)),
                core::TakeCancel::Spent => {
                    unreachable!("internal bug: pending take already spent")
                }
            },
        }
    }

    /// Abandon the take. A message already committed to it is discarded.
    pub fn abort(&mut self) {
        self.0.cancel();
    }
}

impl<T> Future for TakeFut<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.is_terminated() {
            return Poll::Pending;
        }
        Pin::new(&mut this.0).poll(cx).map(map_take_poll)
    }
}

#[cfg(feature = "futures")]
impl<T> futures::future::FusedFuture for TakeFut<T> {
    fn is_terminated(&self) -> bool {
        TakeFut::is_terminated(self)
    }
}

impl<T> Drop for TakeFut<T> {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::error::TryPutCause;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;
    use std::thread;

    const LONG: Duration = Duration::from_secs(5);
    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn basic_1000() {
        let chan = Channel::bounded(4);
        let chan_2 = chan.clone();
        let handle = thread::spawn(move || {
            for i in 0..1000u32 {
                chan_2.put(i).block_timeout(LONG).unwrap();
            }
            chan_2.close();
        });
        for i in 0..1000u32 {
            assert_eq!(chan.take().block_timeout(LONG).unwrap(), Some(i));
        }
        assert_eq!(chan.take().block_timeout(LONG).unwrap(), None);
        handle.join().unwrap();
    }

    #[test]
    fn rendezvous_hands_off() {
        let chan = Channel::rendezvous();
        let chan_2 = chan.clone();
        let handle = thread::spawn(move || {
            chan_2.put(7u32).block_timeout(LONG).unwrap();
        });
        assert_eq!(chan.take().block_timeout(LONG).unwrap(), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn rendezvous_put_parks_without_taker() {
        let chan = Channel::rendezvous();
        let err = chan.put(1u32).try_now().unwrap_err();
        assert_eq!(err.cause, TryPutCause::Full);
        assert_eq!(err.msg, 1);

        // with a taker waiting, the same put completes
        let chan_2 = chan.clone();
        let handle = thread::spawn(move || chan_2.take().block_timeout(LONG).unwrap());
        thread::sleep(SHORT);
        chan.put(2u32).block_timeout(LONG).unwrap();
        assert_eq!(handle.join().unwrap(), Some(2));
    }

    #[test]
    fn bounded_accepts_capacity_then_parks() {
        let chan = Channel::bounded(2);
        chan.put(1u32).try_now().unwrap();
        chan.put(2u32).try_now().unwrap();
        let err = chan.put(3u32).try_now().unwrap_err();
        assert_eq!(err.cause, TryPutCause::Full);
        assert_eq!(err.msg, 3);
        assert_eq!(chan.len(), 2);
    }

    #[test]
    fn parked_put_completes_after_take() {
        // fill a capacity-2 channel with A and B, park C, then take: the take must return A
        // and the freed room must admit C, in that order
        let chan = Channel::bounded(2);
        chan.put("A").try_now().unwrap();
        chan.put("B").try_now().unwrap();

        let chan_2 = chan.clone();
        let parked = thread::spawn(move || chan_2.put("C").block_timeout(LONG));
        thread::sleep(SHORT);
        assert_eq!(chan.len(), 2);

        assert_eq!(chan.take().block_timeout(LONG).unwrap(), Some("A"));
        parked.join().unwrap().unwrap();
        assert_eq!(chan.take().block_timeout(LONG).unwrap(), Some("B"));
        assert_eq!(chan.take().block_timeout(LONG).unwrap(), Some("C"));
        assert!(chan.is_empty());
    }

    #[test]
    fn parked_put_wakes_when_predecessor_stores() {
        // an unpolled put is already in line, so a second put parks behind it even though
        // the buffer has room for both
        let chan = Channel::bounded(2);
        let mut first = chan.put(1u32);
        let chan_2 = chan.clone();
        let parked = thread::spawn(move || chan_2.put(2u32).block_timeout(LONG));
        thread::sleep(SHORT);
        assert_eq!(chan.len(), 0);

        // resolving the front put must wake the parked one, not leave it to its timeout
        first.try_now().unwrap();
        parked.join().unwrap().unwrap();
        assert_eq!(chan.len(), 2);
    }

    #[test]
    fn close_drains_then_sentinel() {
        let chan = Channel::bounded(8);
        chan.put(1u32).try_now().unwrap();
        chan.put(2u32).try_now().unwrap();

        assert!(chan.close());
        assert!(!chan.close());
        assert!(chan.is_closed());

        let err = chan.put(3u32).block().unwrap_err();
        assert_eq!(err.msg, 3);

        assert_eq!(chan.take().block(), Some(1));
        assert_eq!(chan.take().block(), Some(2));
        assert_eq!(chan.take().block(), None);
        assert_eq!(chan.take().block(), None);
    }

    #[test]
    fn close_fails_parked_put() {
        let chan = Channel::rendezvous();
        let chan_2 = chan.clone();
        let parked = thread::spawn(move || chan_2.put(9u32).block_timeout(LONG));
        thread::sleep(SHORT);
        chan.close();
        let err = parked.join().unwrap().unwrap_err();
        assert_eq!(err.into_msg(), 9);
    }

    #[test]
    fn close_wakes_parked_take() {
        let chan = Channel::<u32>::rendezvous();
        let chan_2 = chan.clone();
        let parked = thread::spawn(move || chan_2.take().block_timeout(LONG));
        thread::sleep(SHORT);
        chan.close();
        assert_eq!(parked.join().unwrap().unwrap(), None);
    }

    #[test]
    fn close_resolves_every_parked_take() {
        // three parked takes must all see the sentinel, however their wakeups interleave
        let chan = Channel::<u32>::rendezvous();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let chan_2 = chan.clone();
            handles.push(thread::spawn(move || chan_2.take().block_timeout(LONG)));
        }
        thread::sleep(SHORT);
        chan.close();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), None);
        }
    }

    #[test]
    fn put_after_close_fails_either_path() {
        let chan = Channel::bounded(4);
        chan.close();
        // fast path: the handle already sees the closed flag
        let err = chan.put(1u32).try_now().unwrap_err();
        assert_eq!(err.cause, TryPutCause::Closed);
        assert_eq!(err.msg, 1);
        let err = chan.put(2u32).block().unwrap_err();
        assert_eq!(err.msg, 2);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let chan = Channel::drop_oldest(2);
        chan.put(1u32).try_now().unwrap();
        chan.put(2u32).try_now().unwrap();
        chan.put(3u32).try_now().unwrap();
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.take().try_now().unwrap(), Some(2));
        assert_eq!(chan.take().try_now().unwrap(), Some(3));
    }

    #[test]
    fn drop_newest_discards_incoming() {
        let chan = Channel::drop_newest(2);
        chan.put(1u32).try_now().unwrap();
        chan.put(2u32).try_now().unwrap();
        chan.put(3u32).try_now().unwrap();
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.take().try_now().unwrap(), Some(1));
        assert_eq!(chan.take().try_now().unwrap(), Some(2));
    }

    #[test]
    fn drop_policy_put_never_parks_behind_another() {
        // an unpolled earlier put is still in line; later drop-policy puts must succeed
        // anyway rather than queue up or report the channel full
        let chan = Channel::drop_oldest(1);
        let mut first = chan.put(1u32);
        chan.put(2u32).try_now().unwrap();
        first.try_now().unwrap();
        assert_eq!(chan.len(), 1);

        let chan = Channel::drop_newest(1);
        let mut first = chan.put(3u32);
        chan.put(4u32).try_now().unwrap();
        first.try_now().unwrap();
        assert_eq!(chan.len(), 1);
    }

    #[test]
    fn rescind_returns_undelivered() {
        let chan = Channel::rendezvous();
        let mut fut = chan.put(5u32);
        assert_eq!(fut.rescind(), Some(5));
        assert!(fut.is_terminated());

        // a rescinded put leaves no trace: a later taker still parks
        assert_eq!(chan.take().try_now().unwrap_err(), TryTakeError);
    }

    #[test]
    fn try_take_empty_vs_closed() {
        let chan = Channel::<u32>::bounded(1);
        assert_eq!(chan.take().try_now(), Err(TryTakeError));
        chan.close();
        assert_eq!(chan.take().try_now(), Ok(None));
    }

    #[test]
    fn take_gives_up_at_deadline() {
        let chan = Channel::<u32>::rendezvous();
        let start = Instant::now();
        let err = chan
            .take()
            .block_timeout(Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err, TakeTimeoutError);
        assert!(start.elapsed() >= Duration::from_millis(30));
        // the aborted take left no waiter behind
        assert_eq!(
            chan.put(1u32).try_now().unwrap_err().cause,
            TryPutCause::Full
        );
    }

    #[test]
    fn len_tracks_buffer() {
        let chan = Channel::bounded(3);
        assert_eq!(chan.len(), 0);
        chan.put(1u32).try_now().unwrap();
        chan.put(2u32).try_now().unwrap();
        assert_eq!(chan.len(), 2);
        chan.take().try_now().unwrap();
        assert_eq!(chan.len(), 1);
    }

    #[test]
    fn stochastic_pipeline() {
        // several producers race through a small buffer under random jitter. every message
        // must arrive exactly once, and each producer's own sequence must stay in order.
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 250;

        let chan = Channel::bounded(3);
        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let chan_2 = chan.clone();
            producers.push(thread::spawn(move || {
                let mut rng = Pcg64Mcg::seed_from_u64(0xbeef + u64::from(p));
                for i in 0..PER_PRODUCER {
                    if rng.gen_range(0..4u32) == 0 {
                        thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                    }
                    chan_2.put((p, i)).block_timeout(LONG).unwrap();
                }
            }));
        }

        let chan_2 = chan.clone();
        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(msg) = chan_2.take().block_timeout(LONG).unwrap() {
                seen.push(msg);
            }
            seen
        });

        for handle in producers {
            handle.join().unwrap();
        }
        chan.close();

        let seen = consumer.join().unwrap();
        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
        for p in 0..PRODUCERS {
            let sequence: Vec<u32> = seen.iter().filter(|(q, _)| *q == p).map(|&(_, i)| i).collect();
            assert_eq!(sequence, (0..PER_PRODUCER).collect::<Vec<u32>>());
        }
    }
}
